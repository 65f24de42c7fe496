pub(crate) mod agents;

pub(crate) mod logging;
