//! A set of agents that reach each other through a shared [LocalNetwork].
//!
//! Every agent has its own [InMemoryBus] hub, registered on the network under the endpoint
//! `local://<name>`, and a context bundling that hub, the network and [PlaintextCrypto].

use std::time::Duration;

use coprotocols_rs::{
    consensus::ConsensusConfiguration,
    context::AgentContext,
    bus::in_memory::InMemoryBus,
    messages::{
        envelope::Envelope,
        message_type::{MessageType, DIDCOMM_DOC_URI},
    },
    transport::{local::LocalNetwork, plaintext::PlaintextCrypto},
    types::{
        crypto_primitives::Keypair,
        data_types::Did,
        pairwise::{Directory, Me, Pairwise, Their},
    },
};
use serde_json::json;

pub(crate) type TestContext =
    AgentContext<InMemoryBus, LocalNetwork<PlaintextCrypto>, PlaintextCrypto>;

pub(crate) const TEST_PROTOCOL: &str = "test-protocol";

pub(crate) struct Agent {
    pub(crate) name: String,
    pub(crate) me: Me,
    pub(crate) endpoint: String,
    pub(crate) hub: InMemoryBus,
    pub(crate) context: TestContext,
}

impl Agent {
    pub(crate) fn did(&self) -> Did {
        self.me.did.clone()
    }

    /// How the other agents address this one.
    pub(crate) fn their(&self) -> Their {
        Their::new(self.me.did.clone(), self.me.verkey(), self.endpoint.clone())
    }

    pub(crate) fn pairwise_with(&self, other: &Agent) -> Pairwise {
        Pairwise::new(self.me.clone(), other.their())
    }

    /// Every agent in `agents` but this one.
    pub(crate) fn directory(&self, agents: &[Agent]) -> Directory {
        agents
            .iter()
            .filter(|agent| agent.name != self.name)
            .map(Agent::their)
            .collect()
    }

    pub(crate) fn consensus_config(&self, agents: &[Agent], time_to_live: Duration) -> ConsensusConfiguration {
        ConsensusConfiguration::builder()
            .me(self.me.clone())
            .directory(self.directory(agents))
            .time_to_live(time_to_live)
            .log_events(true)
            .build()
    }
}

/// Create one agent per name, all registered on the returned network.
pub(crate) fn agents(names: &[&str]) -> (LocalNetwork<PlaintextCrypto>, Vec<Agent>) {
    let network = LocalNetwork::new(PlaintextCrypto);
    let agents = names
        .iter()
        .map(|name| {
            let endpoint = format!("local://{name}");
            let hub = InMemoryBus::new();
            network.register(endpoint.clone(), hub.clone());
            let context = AgentContext::builder()
                .bus_factory(hub.clone())
                .transport(network.clone())
                .crypto(PlaintextCrypto)
                .build();
            Agent {
                name: name.to_string(),
                me: Me::new(Did::new(format!("did:peer:{name}")), Keypair::generate()),
                endpoint,
                hub,
                context,
            }
        })
        .collect();
    (network, agents)
}

pub(crate) fn dids(agents: &[Agent]) -> Vec<Did> {
    agents.iter().map(Agent::did).collect()
}

/// A message of [TEST_PROTOCOL] named `name`, carrying `text`.
pub(crate) fn test_message(name: &str, text: &str) -> Envelope {
    let mut envelope = Envelope::new(MessageType::new(DIDCOMM_DOC_URI, TEST_PROTOCOL, "1.0", name));
    envelope.set_field("text", json!(text)).unwrap();
    envelope
}
