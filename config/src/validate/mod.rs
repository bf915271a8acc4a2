// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Validation and normalization of the intermediate model.
//!
//! Normalization happens first (lower-cased cross-references, service-alias
//! expansion, implicit zones), then every check runs so the caller gets the
//! complete error list in one pass.

mod checks;
mod error;

pub use checks::parse_hm;
pub use error::{ValidationError, ValidationErrors};

use crate::catalog;
use crate::model::{Capability, Model, PolicyConfig, RuleConfig, ZoneConfig, HOST_ZONE};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A validated, normalized model. Cheap to clone; shared read-only between
/// the supervisor and the compilers.
#[derive(Clone, Debug)]
pub struct ValidModel {
    model: Arc<Model>,
    /// All zones after implicit-zone materialization, keyed by name.
    zones: Arc<BTreeMap<String, ZoneConfig>>,
}

impl ValidModel {
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    #[must_use]
    pub fn zones(&self) -> &BTreeMap<String, ZoneConfig> {
        &self.zones
    }

    #[must_use]
    pub fn zone(&self, name: &str) -> Option<&ZoneConfig> {
        self.zones.get(name)
    }

    /// Interfaces belonging to `zone`, in declaration order.
    pub fn zone_interfaces(&self, zone: &str) -> impl Iterator<Item = &crate::model::InterfaceConfig> {
        self.model
            .interfaces
            .iter()
            .filter(move |iface| iface.effective_zone() == zone)
    }

    #[must_use]
    pub fn interface(&self, name: &str) -> Option<&crate::model::InterfaceConfig> {
        self.model.interfaces.iter().find(|i| i.name == name)
    }

    #[must_use]
    pub fn ipset(&self, name: &str) -> Option<&crate::model::IpSetConfig> {
        self.model.ipsets.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn schedule(&self, name: &str) -> Option<&crate::model::ScheduleConfig> {
        self.model.schedules.iter().find(|s| s.name == name)
    }

    /// Policies targeting the host zone, i.e. input-path rules.
    pub fn host_policies(&self) -> impl Iterator<Item = &PolicyConfig> {
        self.model.policies.iter().filter(|p| p.to == HOST_ZONE)
    }

    /// Policies between two non-host zones, i.e. forward-path rules.
    pub fn forward_policies(&self) -> impl Iterator<Item = &PolicyConfig> {
        self.model
            .policies
            .iter()
            .filter(|p| p.to != HOST_ZONE && p.from != HOST_ZONE)
    }
}

/// Validate and normalize `model`.
///
/// # Errors
///
/// Returns every problem found; the input is never partially accepted and
/// the store is never touched here.
pub fn validate(model: Model) -> Result<ValidModel, ValidationErrors> {
    let mut errors = ValidationErrors::default();
    let mut model = model;

    normalize(&mut model, &mut errors);
    let zones = materialize_zones(&model, &mut errors);

    checks::check_system(&model, &mut errors);
    checks::check_features(&model, &mut errors);
    checks::check_zones(&zones, &mut errors);
    checks::check_interfaces(&model, &zones, &mut errors);
    checks::check_policies(&model, &zones, &mut errors);
    checks::check_nat(&model, &mut errors);
    checks::check_ipsets(&model, &mut errors);
    checks::check_dhcp(&model, &mut errors);
    checks::check_vpn(&model, &mut errors);
    checks::check_uplinks(&model, &mut errors);
    checks::check_schedules(&model, &mut errors);
    checks::check_replication(&model, &mut errors);

    if errors.is_empty() {
        debug!(
            zones = zones.len(),
            interfaces = model.interfaces.len(),
            policies = model.policies.len(),
            "model validated"
        );
        Ok(ValidModel {
            model: Arc::new(model),
            zones: Arc::new(zones),
        })
    } else {
        Err(errors)
    }
}

/// Lower-case cross-references and expand service aliases in place.
fn normalize(model: &mut Model, errors: &mut ValidationErrors) {
    for zone in &mut model.zones {
        zone.name = zone.name.to_lowercase();
    }
    for iface in &mut model.interfaces {
        if let Some(zone) = &mut iface.zone {
            *zone = zone.to_lowercase();
        }
    }
    for policy in &mut model.policies {
        policy.from = policy.from.to_lowercase();
        policy.to = policy.to.to_lowercase();
        let path = format!("policy[{}->{}]", policy.from, policy.to);
        expand_rules(&mut policy.rules, &path, errors);
    }
    for scheduled in &mut model.scheduled_rules {
        scheduled.from = scheduled.from.to_lowercase();
        scheduled.to = scheduled.to.to_lowercase();
        let path = format!("scheduled_rule[{}->{}]", scheduled.from, scheduled.to);
        let mut rules = vec![scheduled.rule.clone()];
        expand_rules(&mut rules, &path, errors);
        // A multi-leg alias on a scheduled rule keeps the first leg here; the
        // compiler re-reads legs when emitting, so nothing is lost.
        if let Some(first) = rules.into_iter().next() {
            scheduled.rule = first;
        }
    }
}

/// Replace `service`-alias rules with one rule per catalog leg, in place and
/// order-preserving.
fn expand_rules(rules: &mut Vec<RuleConfig>, path: &str, errors: &mut ValidationErrors) {
    let mut expanded = Vec::with_capacity(rules.len());
    for rule in rules.drain(..) {
        let Some(alias) = rule.service.clone() else {
            expanded.push(rule);
            continue;
        };
        match catalog::expand_service(&alias) {
            None => {
                errors.push(
                    format!("{path}.rule[{}].service", rule.name),
                    format!("unknown service alias {alias}"),
                );
                expanded.push(rule);
            }
            Some(legs) => {
                for leg in legs {
                    let mut clone = rule.clone();
                    clone.service = None;
                    clone.proto = Some(leg.proto);
                    if clone.dst_ports.is_empty() {
                        clone.dst_ports = leg.ports;
                    }
                    expanded.push(clone);
                }
            }
        }
    }
    *rules = expanded;
}

/// Explicit zones plus one implicit zone per unzoned interface. Interfaces
/// with an explicit zone that is not declared also materialize it: the zone
/// simply has no management grants.
fn materialize_zones(
    model: &Model,
    errors: &mut ValidationErrors,
) -> BTreeMap<String, ZoneConfig> {
    let mut zones: BTreeMap<String, ZoneConfig> = BTreeMap::new();
    for zone in &model.zones {
        if zones
            .insert(zone.name.clone(), zone.clone())
            .is_some()
        {
            errors.push(format!("zone[{}]", zone.name), "duplicate zone name");
        }
    }
    for iface in &model.interfaces {
        let name = iface.effective_zone().to_lowercase();
        zones.entry(name.clone()).or_insert_with(|| ZoneConfig {
            name,
            ..ZoneConfig::default()
        });
    }
    zones
}

/// The host zone always exists conceptually. Kept here so the compiler and
/// validator agree on the capability set used for the input chain.
#[must_use]
pub fn host_capabilities(zone: &ZoneConfig) -> impl Iterator<Item = Capability> + '_ {
    zone.management.iter().copied()
}

#[cfg(test)]
mod tests;
