//! Include/exclude predicate over entity ids and their domains.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

/// One side (include or exclude) of the filter as it appears in config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
  #[serde(default)]
  pub domains:  Vec<String>,
  #[serde(default)]
  pub entities: Vec<String>,
}

impl FilterConfig {
  fn is_empty(&self) -> bool { self.domains.is_empty() && self.entities.is_empty() }
}

#[derive(Debug, Clone)]
pub struct EntityFilter {
  include_domains:  HashSet<String>,
  include_entities: HashSet<String>,
  exclude_domains:  HashSet<String>,
  exclude_entities: HashSet<String>,
  mode:             Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
  PassAll,
  IncludeOnly,
  ExcludeOnly,
  IncludeDomains,
  ExcludeDomains,
  ListedOnly,
}

impl EntityFilter {
  /// Build the predicate.
  ///
  /// With both sides configured, included domains take precedence over
  /// excluded domains, and explicitly listed entities override their domain.
  pub fn new(include: &FilterConfig, exclude: &FilterConfig) -> Self {
    let mode = match (include.is_empty(), exclude.is_empty()) {
      (true, true) => Mode::PassAll,
      (false, true) => Mode::IncludeOnly,
      (true, false) => Mode::ExcludeOnly,
      (false, false) if !include.domains.is_empty() => Mode::IncludeDomains,
      (false, false) if !exclude.domains.is_empty() => Mode::ExcludeDomains,
      (false, false) => Mode::ListedOnly,
    };
    let set = |v: &[String]| v.iter().cloned().collect::<HashSet<_>>();
    Self {
      include_domains: set(&include.domains),
      include_entities: set(&include.entities),
      exclude_domains: set(&exclude.domains),
      exclude_entities: set(&exclude.entities),
      mode,
    }
  }

  /// A filter that lets everything through.
  pub fn pass_all() -> Self { Self::new(&FilterConfig::default(), &FilterConfig::default()) }

  pub fn allows(&self, entity_id: &EntityId) -> bool {
    let id = entity_id.as_str();
    let domain = entity_id.domain();
    match self.mode {
      Mode::PassAll => true,
      Mode::IncludeOnly => self.include_entities.contains(id) || self.include_domains.contains(domain),
      Mode::ExcludeOnly => {
        !self.exclude_entities.contains(id) && !self.exclude_domains.contains(domain)
      }
      Mode::IncludeDomains => {
        if self.include_domains.contains(domain) {
          !self.exclude_entities.contains(id)
        } else {
          self.include_entities.contains(id)
        }
      }
      Mode::ExcludeDomains => {
        if self.exclude_domains.contains(domain) {
          self.include_entities.contains(id)
        } else {
          !self.exclude_entities.contains(id)
        }
      }
      Mode::ListedOnly => self.include_entities.contains(id),
    }
  }
}

impl Default for EntityFilter {
  fn default() -> Self { Self::pass_all() }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cfg(domains: &[&str], entities: &[&str]) -> FilterConfig {
    FilterConfig {
      domains:  domains.iter().map(|s| s.to_string()).collect(),
      entities: entities.iter().map(|s| s.to_string()).collect(),
    }
  }

  fn allows(f: &EntityFilter, id: &str) -> bool { f.allows(&EntityId::parse(id).unwrap()) }

  #[test]
  fn empty_filter_passes_everything() {
    let f = EntityFilter::pass_all();
    assert!(allows(&f, "sensor.a"));
    assert!(allows(&f, "light.b"));
  }

  #[test]
  fn include_only() {
    let f = EntityFilter::new(&cfg(&["sensor"], &["light.porch"]), &FilterConfig::default());
    assert!(allows(&f, "sensor.a"));
    assert!(allows(&f, "light.porch"));
    assert!(!allows(&f, "light.kitchen"));
  }

  #[test]
  fn exclude_only() {
    let f = EntityFilter::new(&FilterConfig::default(), &cfg(&["automation"], &["sensor.noisy"]));
    assert!(allows(&f, "sensor.a"));
    assert!(!allows(&f, "sensor.noisy"));
    assert!(!allows(&f, "automation.morning"));
  }

  #[test]
  fn included_domain_with_excluded_entity() {
    let f = EntityFilter::new(&cfg(&["sensor"], &["light.porch"]), &cfg(&["sensor"], &["sensor.noisy"]));
    assert!(allows(&f, "sensor.a"));
    assert!(!allows(&f, "sensor.noisy"));
    assert!(allows(&f, "light.porch"));
    assert!(!allows(&f, "switch.x"));
  }

  #[test]
  fn excluded_domain_with_included_entity() {
    let f = EntityFilter::new(&cfg(&[], &["automation.keep"]), &cfg(&["automation"], &["sensor.noisy"]));
    assert!(allows(&f, "automation.keep"));
    assert!(!allows(&f, "automation.other"));
    assert!(allows(&f, "sensor.a"));
    assert!(!allows(&f, "sensor.noisy"));
  }

  #[test]
  fn entity_lists_only_pass_listed_entities() {
    let f = EntityFilter::new(&cfg(&[], &["sensor.a"]), &cfg(&[], &["sensor.b"]));
    assert!(allows(&f, "sensor.a"));
    assert!(!allows(&f, "sensor.b"));
    assert!(!allows(&f, "sensor.c"));
  }
}
