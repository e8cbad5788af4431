// src/groups.rs
//
// Agent groups: the fixed partition of tunable parameters across the
// cooperating sub-agents.
//
// - orderer-consensus: every tunable key in the `configtx` / `orderer` sections
// - peer-core: tunable `peer` keys without a gossip marker
// - peer-gossip-network: tunable `peer` keys containing `GOSSIP`
//
// Only keys on the tunable allow-list are controlled by an agent. The list is
// ordered by importance; `TunableSet::from_importance(n)` keeps the first `n`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Ordered allow-list of tunable keys, most important first.
pub const TUNABLE_KEYS: &[&str] = &[
    "CORE_PEER_GOSSIP_STATE_BLOCKBUFFERSIZE",
    "CORE_PEER_GOSSIP_PUBLISHCERTPERIOD",
    "CORE_PEER_GOSSIP_PROPAGATEITERATIONS",
    "PreferredMaxBytes",
    "CORE_PEER_KEEPALIVE_MININTERVAL",
    "CORE_PEER_DISCOVERY_AUTHCACHEMAXSIZE",
    "CORE_PEER_DELIVERYCLIENT_CONNTIMEOUT",
    "CORE_PEER_KEEPALIVE_CLIENT_INTERVAL",
    "CORE_PEER_CLIENT_CONNTIMEOUT",
    "CORE_PEER_GOSSIP_SENDBUFFSIZE",
    "CORE_PEER_KEEPALIVE_CLIENT_TIMEOUT",
    "CORE_PEER_GOSSIP_MAXPROPAGATIONBURSTLATENCY",
    "CORE_PEER_GOSSIP_REQUESTWAITTIME",
    "CORE_PEER_GOSSIP_STATE_MAXRETRIES",
    "CORE_PEER_KEEPALIVE_DELIVERYCLIENT_TIMEOUT",
    "ORDERER_GENERAL_KEEPALIVE_SERVERTIMEOUT",
    "CORE_PEER_GOSSIP_PUBLISHSTATEINFOINTERVAL",
    "CORE_PEER_GOSSIP_MAXBLOCKCOUNTTOSTORE",
    "ORDERER_GENERAL_KEEPALIVE_SERVERMININTERVAL",
    "CORE_PEER_GOSSIP_REQUESTSTATEINFOINTERVAL",
    "CORE_PEER_GOSSIP_ALIVEEXPIRATIONTIMEOUT",
    "CORE_PEER_GOSSIP_STATE_CHECKINTERVAL",
    "CORE_PEER_KEEPALIVE_DELIVERYCLIENT_INTERVAL",
    "CORE_PEER_GOSSIP_RECONNECTINTERVAL",
    "CORE_PEER_GOSSIP_PULLPEERNUM",
    "CORE_PEER_GOSSIP_STATE_BATCHSIZE",
    "CORE_PEER_GOSSIP_RECVBUFFSIZE",
    "CORE_PEER_GOSSIP_RESPONSEWAITTIME",
    "CORE_PEER_GOSSIP_PROPAGATEPEERNUM",
    "CORE_PEER_GOSSIP_PULLINTERVAL",
    "CORE_PEER_GOSSIP_STATE_RESPONSETIMEOUT",
    "AbsoluteMaxBytes",
    "CORE_PEER_GOSSIP_MAXPROPAGATIONBURSTSIZE",
    "BatchTimeout",
    "MaxMessageCount",
    "ORDERER_GENERAL_AUTHENTICATION_TIMEWINDOW",
    "ORDERER_GENERAL_CLUSTER_SENDBUFFERSIZE",
    "ORDERER_GENERAL_KEEPALIVE_SERVERINTERVAL",
    "ORDERER_METRICS_STATSD_WRITEINTERVAL",
    "ORDERER_RAMLEDGER_HISTORYSIZE",
    "CORE_PEER_GOSSIP_MEMBERSHIPTRACKERINTERVAL",
    "CORE_PEER_AUTHENTICATION_TIMEWINDOW",
    "CORE_PEER_DELIVERYCLIENT_RECONNECTTOTALTIMETHRESHOLD",
    "CORE_PEER_DISCOVERY_AUTHCACHEPURGERETENTIONRATIO",
    "CORE_PEER_GOSSIP_ALIVETIMEINTERVAL",
    "CORE_PEER_GOSSIP_CONNTIMEOUT",
    "CORE_PEER_GOSSIP_DIALTIMEOUT",
    "CORE_PEER_GOSSIP_DIGESTWAITTIME",
    "CORE_PEER_GOSSIP_ELECTION_LEADERALIVETHRESHOLD",
    "CORE_PEER_GOSSIP_ELECTION_STARTUPGRACEPERIOD",
    "CORE_PEER_DELIVERYCLIENT_RECONNECTBACKOFFTHRESHOLD",
    "CORE_PEER_GOSSIP_ELECTION_MEMBERSHIPSAMPLEINTERVAL",
];

/// Consensus parameters the ledger rejects at zero; decoded values floor at 1.
pub const MUST_BE_POSITIVE: &[&str] = &[
    "BatchTimeout",
    "MaxMessageCount",
    "AbsoluteMaxBytes",
    "PreferredMaxBytes",
];

/// Key-name marker routing `peer` keys to the gossip/network agent.
pub const NETWORK_MARKER: &str = "GOSSIP";

pub fn must_be_positive(key: &str) -> bool {
    MUST_BE_POSITIVE.contains(&key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentGroup {
    OrdererConsensus,
    PeerCore,
    PeerGossipNetwork,
}

impl AgentGroup {
    /// All groups in agent order (agent `i` controls `ALL[i]`).
    pub const ALL: [AgentGroup; 3] = [
        AgentGroup::OrdererConsensus,
        AgentGroup::PeerCore,
        AgentGroup::PeerGossipNetwork,
    ];

    pub fn index(self) -> usize {
        match self {
            AgentGroup::OrdererConsensus => 0,
            AgentGroup::PeerCore => 1,
            AgentGroup::PeerGossipNetwork => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentGroup::OrdererConsensus => "orderer-consensus",
            AgentGroup::PeerCore => "peer-core",
            AgentGroup::PeerGossipNetwork => "peer-gossip-network",
        }
    }
}

/// Route a catalog key to its group by section membership and key marker.
///
/// Returns None for sections no agent controls.
pub fn assign_group(section: &str, key: &str) -> Option<AgentGroup> {
    match section {
        "configtx" | "orderer" => Some(AgentGroup::OrdererConsensus),
        "peer" if key.contains(NETWORK_MARKER) => Some(AgentGroup::PeerGossipNetwork),
        "peer" => Some(AgentGroup::PeerCore),
        _ => None,
    }
}

/// The set of keys agents are allowed to control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableSet {
    keys: BTreeSet<String>,
}

impl Default for TunableSet {
    fn default() -> Self {
        Self::from_importance(TUNABLE_KEYS.len())
    }
}

impl TunableSet {
    /// Keep the `n` most important entries of [`TUNABLE_KEYS`].
    pub fn from_importance(n: usize) -> Self {
        Self::from_keys(TUNABLE_KEYS.iter().take(n).copied())
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Group for a catalog key, or None when the key is not tunable.
    pub fn group_of(&self, section: &str, key: &str) -> Option<AgentGroup> {
        if self.contains(key) {
            assign_group(section, key)
        } else {
            None
        }
    }
}
