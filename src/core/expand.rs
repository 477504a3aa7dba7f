//! Placeholder expansion for rule bodies
//!
//! Two independent passes run over every rule line, variables first:
//!
//! - `${name}` is replaced by the value of variable `name`. The line is
//!   rescanned from the left after each substitution, so a value that itself
//!   contains `${...}` or `%{...}` is expanded as well.
//! - `%{zone}` fans a line out into one line per interface of `zone`. With
//!   several zone placeholders the result is their Cartesian product, the
//!   leftmost placeholder varying slowest.
//!
//! Both passes stop with [`Error::ExpansionLimit`] instead of looping when a
//! variable or zone refers to itself.

use crate::core::error::{Error, Result};
use crate::core::model::Config;
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

/// Maximum `${...}` substitutions performed on a single line
pub const MAX_SUBSTITUTIONS: usize = 256;

/// Maximum nesting of `%{...}` expansions on a single line
pub const MAX_ZONE_DEPTH: usize = 32;

static VARIABLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("variable pattern is valid"));

static ZONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\{([^}]+)\}").expect("zone pattern is valid"));

/// Span of the first placeholder in `text` and the name inside it
fn first_placeholder<'t>(pattern: &Regex, text: &'t str) -> Option<(Range<usize>, &'t str)> {
    let captures = pattern.captures(text)?;
    Some((captures.get(0)?.range(), captures.get(1)?.as_str()))
}

/// Expands placeholders against one configuration
#[derive(Debug, Clone, Copy)]
pub struct Expander<'a> {
    config: &'a Config,
}

impl<'a> Expander<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Variable substitution followed by zone expansion
    pub fn expand(&self, rule: &str) -> Result<Vec<String>> {
        let substituted = self.substitute_variables(rule)?;
        self.expand_zones(&substituted)
    }

    /// Replaces every `${name}` placeholder, left to right.
    ///
    /// # Errors
    ///
    /// - [`Error::UndefinedVariable`] if a name is not declared
    /// - [`Error::ExpansionLimit`] after [`MAX_SUBSTITUTIONS`] replacements
    pub fn substitute_variables(&self, rule: &str) -> Result<String> {
        let mut expanded = rule.to_string();
        let mut substitutions = 0;

        while let Some((span, name)) = first_placeholder(&VARIABLE_PATTERN, &expanded) {
            if substitutions == MAX_SUBSTITUTIONS {
                return Err(Error::ExpansionLimit {
                    placeholder: format!("${{{name}}}"),
                    rule: rule.to_string(),
                });
            }

            let value = self
                .config
                .variable(name)
                .ok_or_else(|| Error::UndefinedVariable {
                    name: name.to_string(),
                    rule: rule.to_string(),
                })?;

            expanded.replace_range(span, value);
            substitutions += 1;
        }

        Ok(expanded)
    }

    /// Fans `rule` out into one line per interface combination.
    ///
    /// A line without zone placeholders comes back unchanged as the only
    /// element. A zone with no interfaces produces no lines.
    ///
    /// # Errors
    ///
    /// - [`Error::UndefinedZone`] if a zone is not declared
    /// - [`Error::ExpansionLimit`] past [`MAX_ZONE_DEPTH`] nested expansions
    pub fn expand_zones(&self, rule: &str) -> Result<Vec<String>> {
        let mut expanded = Vec::new();
        self.expand_zones_into(rule, rule, 0, &mut expanded)?;
        Ok(expanded)
    }

    fn expand_zones_into(
        &self,
        original: &str,
        current: &str,
        depth: usize,
        out: &mut Vec<String>,
    ) -> Result<()> {
        let Some((span, zone)) = first_placeholder(&ZONE_PATTERN, current) else {
            out.push(current.to_string());
            return Ok(());
        };

        if depth == MAX_ZONE_DEPTH {
            return Err(Error::ExpansionLimit {
                placeholder: format!("%{{{zone}}}"),
                rule: original.to_string(),
            });
        }

        let interfaces =
            self.config
                .zone_interfaces(zone)
                .ok_or_else(|| Error::UndefinedZone {
                    name: zone.to_string(),
                    rule: original.to_string(),
                })?;

        for interface in interfaces {
            let mut candidate = current.to_string();
            candidate.replace_range(span.clone(), interface);
            self.expand_zones_into(original, &candidate, depth + 1, out)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Zone;

    fn zones(entries: &[(&str, &[&str])]) -> Config {
        let mut config = Config::default();
        for (name, interfaces) in entries {
            config.zones.insert(
                (*name).to_string(),
                Zone {
                    interfaces: interfaces.iter().map(ToString::to_string).collect(),
                    ..Zone::default()
                },
            );
        }
        config
    }

    fn variables(entries: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        for (name, value) in entries {
            config
                .variables
                .insert((*name).to_string(), (*value).to_string());
        }
        config
    }

    #[test]
    fn test_variable_substitution() {
        let config = variables(&[("host1", "10.0.0.10"), ("host2", "192.168.0.10")]);
        let expanded = Expander::new(&config)
            .substitute_variables("-A PREROUTING -s ${host1} -j DNAT --to-destination ${host2}")
            .unwrap();
        assert_eq!(
            expanded,
            "-A PREROUTING -s 10.0.0.10 -j DNAT --to-destination 192.168.0.10"
        );
    }

    #[test]
    fn test_repeated_variable() {
        let config = variables(&[("net", "10.0.0.0/8")]);
        let expanded = Expander::new(&config)
            .substitute_variables("-s ${net} -d ${net}")
            .unwrap();
        assert_eq!(expanded, "-s 10.0.0.0/8 -d 10.0.0.0/8");
    }

    #[test]
    fn test_variable_value_is_rescanned() {
        let config = variables(&[("inner", "1.2.3.4"), ("outer", "-s ${inner}")]);
        let expanded = Expander::new(&config)
            .substitute_variables("-A INPUT ${outer} -j DROP")
            .unwrap();
        assert_eq!(expanded, "-A INPUT -s 1.2.3.4 -j DROP");
    }

    #[test]
    fn test_undefined_variable() {
        let config = variables(&[("known", "x")]);
        let err = Expander::new(&config)
            .substitute_variables("-s ${known} -d ${missing}")
            .unwrap_err();
        match err {
            Error::UndefinedVariable { name, rule } => {
                assert_eq!(name, "missing");
                assert_eq!(rule, "-s ${known} -d ${missing}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_referencing_variable_fails() {
        let config = variables(&[("loop", "x ${loop}")]);
        let err = Expander::new(&config)
            .substitute_variables("-s ${loop}")
            .unwrap_err();
        assert!(matches!(err, Error::ExpansionLimit { placeholder, .. } if placeholder == "${loop}"));
    }

    #[test]
    fn test_zone_expansion_order() {
        let config = zones(&[("lan", &["eth0", "eth1"]), ("dmz", &["eth2", "eth3"])]);
        let expanded = Expander::new(&config)
            .expand_zones("-A FORWARD -i %{lan} -o %{dmz} -j ACCEPT")
            .unwrap();
        assert_eq!(
            expanded,
            [
                "-A FORWARD -i eth0 -o eth2 -j ACCEPT",
                "-A FORWARD -i eth0 -o eth3 -j ACCEPT",
                "-A FORWARD -i eth1 -o eth2 -j ACCEPT",
                "-A FORWARD -i eth1 -o eth3 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_zone_expansion_no_zone() {
        let config = zones(&[("lan", &["eth0", "eth1"])]);
        let rule = "-A INPUT -i lo -j ACCEPT";
        assert_eq!(Expander::new(&config).expand_zones(rule).unwrap(), [rule]);
    }

    #[test]
    fn test_empty_zone_expands_to_nothing() {
        let config = zones(&[("spare", &[])]);
        let expanded = Expander::new(&config)
            .expand_zones("-A INPUT -i %{spare} -j ACCEPT")
            .unwrap();
        assert!(expanded.is_empty());
    }

    #[test]
    fn test_undefined_zone() {
        let config = zones(&[("lan", &["eth0"])]);
        let err = Expander::new(&config)
            .expand_zones("-A FORWARD -i %{lan} -o %{wan} -j ACCEPT")
            .unwrap_err();
        assert!(matches!(err, Error::UndefinedZone { name, .. } if name == "wan"));
    }

    #[test]
    fn test_self_referencing_zone_fails() {
        let config = zones(&[("odd", &["%{odd}"])]);
        let err = Expander::new(&config)
            .expand_zones("-A INPUT -i %{odd} -j ACCEPT")
            .unwrap_err();
        assert!(matches!(err, Error::ExpansionLimit { .. }));
    }

    #[test]
    fn test_variable_can_introduce_zone() {
        let mut config = zones(&[("lan", &["eth0", "eth1"])]);
        config
            .variables
            .insert("inside".to_string(), "-i %{lan}".to_string());

        let expanded = Expander::new(&config)
            .expand("-A INPUT ${inside} -j ACCEPT")
            .unwrap();
        assert_eq!(
            expanded,
            ["-A INPUT -i eth0 -j ACCEPT", "-A INPUT -i eth1 -j ACCEPT"]
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_no_placeholder_is_identity(rule in "[^$%]*") {
                let config = zones(&[("lan", &["eth0"])]);
                let expander = Expander::new(&config);
                prop_assert_eq!(expander.substitute_variables(&rule).unwrap(), rule.clone());
                prop_assert_eq!(expander.expand_zones(&rule).unwrap(), vec![rule]);
            }

            #[test]
            fn test_zone_cardinality_and_order(sizes in prop::collection::vec(1usize..4, 1..4)) {
                let names: Vec<String> = (0..sizes.len()).map(|i| format!("z{i}")).collect();
                let mut config = Config::default();
                for (name, size) in names.iter().zip(&sizes) {
                    config.zones.insert(name.clone(), Zone {
                        interfaces: (0..*size).map(|n| format!("{name}if{n}")).collect(),
                        ..Zone::default()
                    });
                }

                let rule: String = names.iter().map(|n| format!(" %{{{n}}}")).collect();
                let expanded = Expander::new(&config).expand_zones(&rule).unwrap();

                // Leftmost placeholder varies slowest
                let mut expected = vec![String::new()];
                for name in &names {
                    let interfaces = &config.zones[name].interfaces;
                    expected = expected
                        .iter()
                        .flat_map(|prefix| interfaces.iter().map(move |i| format!("{prefix} {i}")))
                        .collect();
                }

                prop_assert_eq!(expanded.len(), sizes.iter().product::<usize>());
                prop_assert_eq!(expanded, expected);
            }
        }
    }
}
