//! Typed configuration model
//!
//! The merged configuration document as the compiler sees it. Every section is
//! optional and defaults to an empty collection, so a missing key never needs
//! special handling downstream. Maps are [`IndexMap`]s: zones, chains and
//! ipsets are emitted in the order the document declares them.
//!
//! # Example
//!
//! ```
//! use zonewall::core::model::{Config, Table};
//!
//! let config: Config = serde_yaml::from_str(
//!     r"
//! global:
//!   policy:
//!     filter:
//!       INPUT: DROP
//! zones:
//!   lan:
//!     interfaces: [eth0]
//!     rules:
//!       filter:
//!         INPUT:
//!           - -p tcp --dport 22 -j ACCEPT
//! ",
//! )
//! .unwrap();
//!
//! assert_eq!(config.policy(Table::Filter, "INPUT"), "DROP");
//! assert_eq!(config.policy(Table::Filter, "OUTPUT"), "ACCEPT");
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Policy used for any built-in chain the configuration leaves unset
pub const DEFAULT_POLICY: &str = "ACCEPT";

/// Rule bodies keyed by chain name, in declaration order
pub type ChainRules = IndexMap<String, Vec<String>>;

/// Chain rules keyed by table
pub type TableRules = IndexMap<Table, ChainRules>;

/// Policy actions keyed by table, then chain name
pub type PolicyMap = IndexMap<Table, IndexMap<String, String>>;

/// Packet-filter table
///
/// Declaration order is the fixed output order of every rule script.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
    Security,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Filter,
        Table::Nat,
        Table::Mangle,
        Table::Raw,
        Table::Security,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
            Table::Security => "security",
        }
    }

    /// Built-in chains of this table, in kernel hook order
    pub const fn builtin_chains(self) -> &'static [BuiltinChain] {
        use BuiltinChain::{Forward, Input, Output, PostRouting, PreRouting};
        match self {
            Table::Filter | Table::Security => &[Input, Forward, Output],
            Table::Nat => &[PreRouting, Input, Output, PostRouting],
            Table::Mangle => &[PreRouting, Input, Forward, Output, PostRouting],
            Table::Raw => &[PreRouting, Output],
        }
    }
}

/// Built-in chain (kernel hook point)
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum BuiltinChain {
    PreRouting,
    Input,
    Forward,
    Output,
    PostRouting,
}

/// Which interface a dispatcher jump matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packet arriving on an interface (`-i`)
    Ingress,
    /// Packet leaving through an interface (`-o`)
    Egress,
}

impl Direction {
    pub const fn interface_flag(self) -> &'static str {
        match self {
            Direction::Ingress => "-i",
            Direction::Egress => "-o",
        }
    }
}

impl BuiltinChain {
    pub const fn as_str(self) -> &'static str {
        match self {
            BuiltinChain::PreRouting => "PREROUTING",
            BuiltinChain::Input => "INPUT",
            BuiltinChain::Forward => "FORWARD",
            BuiltinChain::Output => "OUTPUT",
            BuiltinChain::PostRouting => "POSTROUTING",
        }
    }

    pub const fn direction(self) -> Direction {
        match self {
            BuiltinChain::PreRouting | BuiltinChain::Input | BuiltinChain::Forward => {
                Direction::Ingress
            }
            BuiltinChain::Output | BuiltinChain::PostRouting => Direction::Egress,
        }
    }
}

/// Address family a rule script is restored into
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Family {
    /// IPv4 (`iptables`)
    Ip,
    /// IPv6 (`ip6tables`)
    Ip6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Ip, Family::Ip6];

    /// File name of the persisted restore file for this family
    pub const fn restore_file_name(self) -> &'static str {
        match self {
            Family::Ip => "iptables.restore",
            Family::Ip6 => "ip6tables.restore",
        }
    }
}

/// Global rule hook, evaluated in declaration order
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Hook {
    PreDefault,
    Default,
    PreZone,
}

/// A named group of interfaces sharing rule sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Rules keyed by table, then built-in chain name
    #[serde(default)]
    pub rules: TableRules,
}

/// An ipset definition
///
/// `type` and `entries` are required, but they are optional here so that a
/// missing field surfaces as a compile error naming the set rather than a
/// generic parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ipset {
    #[serde(rename = "type", default)]
    pub set_type: Option<String>,
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub entries: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Global {
    #[serde(default)]
    pub policy: PolicyMap,
    #[serde(default)]
    pub rules: IndexMap<Hook, TableRules>,
    /// Custom chains keyed by table, then chain name, with their rule bodies
    #[serde(default)]
    pub helper_chains: TableRules,
}

/// The merged firewall configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    /// Top-level policy section; `global.policy` takes precedence
    #[serde(default)]
    pub policies: PolicyMap,
    #[serde(default)]
    pub zones: IndexMap<String, Zone>,
    #[serde(default)]
    pub ipsets: IndexMap<String, Ipset>,
    #[serde(default)]
    pub variables: IndexMap<String, String>,
}

impl Config {
    /// Configured policy for a chain, or [`DEFAULT_POLICY`]
    pub fn policy(&self, table: Table, chain: &str) -> &str {
        [&self.global.policy, &self.policies]
            .into_iter()
            .find_map(|map| map.get(&table).and_then(|chains| chains.get(chain)))
            .map_or(DEFAULT_POLICY, String::as_str)
    }

    pub fn zone_interfaces(&self, zone: &str) -> Option<&[String]> {
        self.zones.get(zone).map(|z| z.interfaces.as_slice())
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Rules of one global hook, empty when the hook is not configured
    pub fn hook_rules(&self, hook: Hook) -> Option<&TableRules> {
        self.global.rules.get(&hook)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}
