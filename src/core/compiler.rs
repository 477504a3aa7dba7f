//! Rule compiler
//!
//! Turns a [`Config`] into the ordered line sequence fed to
//! `iptables-restore`. Compilation happens in two stages:
//!
//! 1. [`RuleCompiler::compile`] produces [`CompiledRule`]s in generation
//!    order: chain policies, helper chains, global hooks (`pre_default`,
//!    `default`, `pre_zone`), zone dispatcher scaffolding, zone rules.
//! 2. [`RuleCompiler::render`] groups them by table in fixed table order,
//!    wraps each table in `*table` / `COMMIT` and runs every line through the
//!    [`Expander`].
//!
//! Every table block is emitted on every run, even when empty, so a restore
//! always resets all five tables.

use crate::core::error::{Error, Result};
use crate::core::expand::Expander;
use crate::core::model::{BuiltinChain, ChainRules, Config, DEFAULT_POLICY, Family, Hook, Table};
use std::str::FromStr;
use strum::IntoEnumIterator;
use tracing::debug;

/// One line of a rule script, tagged with the table it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub table: Table,
    pub line: String,
}

impl CompiledRule {
    /// `:CHAIN POLICY`
    pub fn policy(table: Table, chain: &str, policy: &str) -> Self {
        Self {
            table,
            line: format!(":{chain} {policy}"),
        }
    }

    /// `:CHAIN -`
    pub fn new_chain(table: Table, chain: &str) -> Self {
        Self {
            table,
            line: format!(":{chain} -"),
        }
    }

    /// `-A CHAIN body`
    pub fn append(table: Table, chain: &str, body: &str) -> Self {
        Self {
            table,
            line: format!("-A {chain} {body}"),
        }
    }
}

/// Name of the per-zone chain a built-in chain dispatches into
pub fn dispatcher_chain(zone: &str, chain: &str) -> String {
    format!("{zone}_{chain}")
}

/// Joins script lines into restore input (newline terminated)
pub fn to_script(lines: &[String]) -> String {
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

pub struct RuleCompiler<'a> {
    config: &'a Config,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Produces the unexpanded rule sequence for one address family.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChain`] if a zone declares rules under a chain
    /// that is not a built-in chain.
    pub fn compile(&self, family: Family) -> Result<Vec<CompiledRule>> {
        let mut rules = Vec::new();

        self.policy_rules(&mut rules);
        self.helper_chain_rules(&mut rules);
        self.hook_rules(&mut rules);
        self.zone_dispatchers(&mut rules)?;
        self.zone_rules(&mut rules);

        debug!(%family, count = rules.len(), "compiled rule sequence");
        Ok(rules)
    }

    /// Policy lines forcing `ACCEPT` on every built-in chain, nothing else
    pub fn compile_reset(family: Family) -> Vec<CompiledRule> {
        debug!(%family, "compiling reset rule sequence");
        Table::iter()
            .flat_map(|table| {
                table
                    .builtin_chains()
                    .iter()
                    .map(move |chain| CompiledRule::policy(table, chain.as_str(), DEFAULT_POLICY))
            })
            .collect()
    }

    /// Groups rules into table blocks and expands placeholders.
    ///
    /// # Errors
    ///
    /// Propagates expansion failures ([`Error::UndefinedVariable`],
    /// [`Error::UndefinedZone`], [`Error::ExpansionLimit`]).
    pub fn render(&self, rules: &[CompiledRule]) -> Result<Vec<String>> {
        let expander = Expander::new(self.config);
        let mut lines = Vec::new();

        for table in Table::iter() {
            lines.push(format!("*{table}"));
            for rule in rules.iter().filter(|r| r.table == table) {
                lines.extend(expander.expand(&rule.line)?);
            }
            lines.push("COMMIT".to_string());
        }

        Ok(lines)
    }

    /// Complete restore input for one family
    pub fn script(&self, family: Family) -> Result<String> {
        let rules = self.compile(family)?;
        Ok(to_script(&self.render(&rules)?))
    }

    /// Restore input that resets one family to empty, accepting tables
    pub fn reset_script(family: Family) -> Result<String> {
        let config = Config::default();
        let lines = RuleCompiler::new(&config).render(&Self::compile_reset(family))?;
        Ok(to_script(&lines))
    }

    fn policy_rules(&self, rules: &mut Vec<CompiledRule>) {
        for table in Table::iter() {
            for chain in table.builtin_chains() {
                let policy = self.config.policy(table, chain.as_str());
                rules.push(CompiledRule::policy(table, chain.as_str(), policy));
            }
        }
    }

    fn helper_chain_rules(&self, rules: &mut Vec<CompiledRule>) {
        for (&table, chains) in &self.config.global.helper_chains {
            for chain in chains.keys() {
                rules.push(CompiledRule::new_chain(table, chain));
            }
            append_chain_rules(rules, table, chains);
        }
    }

    fn hook_rules(&self, rules: &mut Vec<CompiledRule>) {
        for hook in Hook::iter() {
            let Some(tables) = self.config.hook_rules(hook) else {
                continue;
            };
            for (&table, chains) in tables {
                append_chain_rules(rules, table, chains);
            }
        }
    }

    fn zone_dispatchers(&self, rules: &mut Vec<CompiledRule>) -> Result<()> {
        for (zone, params) in &self.config.zones {
            for (&table, chains) in &params.rules {
                for chain in chains.keys() {
                    let builtin =
                        BuiltinChain::from_str(chain).map_err(|_| Error::InvalidChain {
                            zone: zone.clone(),
                            table,
                            chain: chain.clone(),
                        })?;

                    let target = dispatcher_chain(zone, chain);
                    let flag = builtin.direction().interface_flag();
                    rules.push(CompiledRule::new_chain(table, &target));
                    rules.push(CompiledRule::append(
                        table,
                        chain,
                        &format!("{flag} %{{{zone}}} -j {target}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn zone_rules(&self, rules: &mut Vec<CompiledRule>) {
        for (zone, params) in &self.config.zones {
            for (&table, chains) in &params.rules {
                for (chain, bodies) in chains {
                    let target = dispatcher_chain(zone, chain);
                    rules.extend(
                        bodies
                            .iter()
                            .map(|body| CompiledRule::append(table, &target, body)),
                    );
                }
            }
        }
    }
}

fn append_chain_rules(rules: &mut Vec<CompiledRule>, table: Table, chains: &ChainRules) {
    for (chain, bodies) in chains {
        rules.extend(
            bodies
                .iter()
                .map(|body| CompiledRule::append(table, chain, body)),
        );
    }
}
