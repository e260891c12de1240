//! Named, versioned cache partitions and their eviction limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Partition category. Declaration order is the purge order under quota
/// pressure: least critical first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
  Static,
  Images,
  Pages,
  Api,
  Booking,
  User,
}

impl Category {
  pub const ALL: [Category; 6] = [
    Category::Static,
    Category::Images,
    Category::Pages,
    Category::Api,
    Category::Booking,
    Category::User,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Category::Static => "static",
      Category::Images => "images",
      Category::Pages => "pages",
      Category::Api => "api",
      Category::Booking => "booking",
      Category::User => "user",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|c| c.as_str() == s)
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Eviction policy of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLimits {
  pub max_entries: usize,
  pub max_age_secs: u64,
  /// Whether the engine may clear this partition on a quota error
  pub purge_on_quota_error: bool,
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

impl PartitionLimits {
  pub fn defaults_for(category: Category) -> Self {
    let (max_entries, max_age_secs, purge_on_quota_error) = match category {
      Category::Static => (100, 30 * DAY, true),
      Category::Images => (60, 30 * DAY, true),
      Category::Pages => (50, DAY, true),
      Category::Api => (100, HOUR, true),
      // Booking and user data must never vanish silently
      Category::Booking => (50, HOUR, false),
      Category::User => (20, DAY, false),
    };
    Self {
      max_entries,
      max_age_secs,
      purge_on_quota_error,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
  pub name: String,
  pub category: Category,
  pub limits: PartitionLimits,
}

/// Build the storage name `<prefix>-<category>-<version>`.
pub fn partition_name(prefix: &str, category: Category, version: &str) -> String {
  format!("{}-{}-{}", prefix, category, version)
}

/// Split a storage name into `(prefix, category, version)`.
///
/// Names with an unknown category still parse so that partitions from
/// releases with a different category set can be recognized and removed.
pub fn parse_partition_name(name: &str) -> Option<(&str, &str, &str)> {
  let mut parts = name.splitn(3, '-');
  let prefix = parts.next()?;
  let category = parts.next()?;
  let version = parts.next()?;
  if prefix.is_empty() || category.is_empty() || version.is_empty() {
    return None;
  }
  Some((prefix, category, version))
}

/// The partitions of the active release.
#[derive(Debug, Clone)]
pub struct PartitionSet {
  prefix: String,
  version: String,
  partitions: BTreeMap<Category, Partition>,
}

impl PartitionSet {
  pub fn new(prefix: &str, version: &str, overrides: &BTreeMap<Category, PartitionLimits>) -> Self {
    let partitions = Category::ALL
      .into_iter()
      .map(|category| {
        let limits = overrides
          .get(&category)
          .copied()
          .unwrap_or_else(|| PartitionLimits::defaults_for(category));
        let partition = Partition {
          name: partition_name(prefix, category, version),
          category,
          limits,
        };
        (category, partition)
      })
      .collect();

    Self {
      prefix: prefix.to_string(),
      version: version.to_string(),
      partitions,
    }
  }

  pub fn get(&self, category: Category) -> &Partition {
    // Every category is populated in `new`
    &self.partitions[&category]
  }

  pub fn iter(&self) -> impl Iterator<Item = &Partition> {
    self.partitions.values()
  }

  /// Purgeable partitions, least critical first.
  pub fn purge_order(&self) -> impl Iterator<Item = &Partition> {
    self.iter().filter(|p| p.limits.purge_on_quota_error)
  }

  /// True for names owned by this product that belong to another release.
  pub fn is_outdated(&self, name: &str) -> bool {
    match parse_partition_name(name) {
      Some((prefix, _, version)) => prefix == self.prefix && version != self.version,
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partition_naming() {
    let set = PartitionSet::new("innkeep", "v3", &BTreeMap::new());
    assert_eq!(set.get(Category::Images).name, "innkeep-images-v3");
    assert_eq!(
      parse_partition_name("innkeep-booking-v3"),
      Some(("innkeep", "booking", "v3"))
    );
    assert_eq!(parse_partition_name("innkeep"), None);
  }

  #[test]
  fn test_outdated_detection() {
    let set = PartitionSet::new("innkeep", "v3", &BTreeMap::new());
    assert!(set.is_outdated("innkeep-static-v2"));
    assert!(set.is_outdated("innkeep-legacy-v1"));
    assert!(!set.is_outdated("innkeep-static-v3"));
    // Someone else's cache is left alone
    assert!(!set.is_outdated("other-static-v1"));
  }

  #[test]
  fn test_purge_order_skips_protected() {
    let set = PartitionSet::new("innkeep", "v1", &BTreeMap::new());
    let order: Vec<Category> = set.purge_order().map(|p| p.category).collect();
    assert_eq!(
      order,
      vec![Category::Static, Category::Images, Category::Pages, Category::Api]
    );
  }

  #[test]
  fn test_overrides_apply() {
    let mut overrides = BTreeMap::new();
    overrides.insert(
      Category::Booking,
      PartitionLimits {
        max_entries: 5,
        max_age_secs: 10,
        purge_on_quota_error: false,
      },
    );
    let set = PartitionSet::new("innkeep", "v1", &overrides);
    assert_eq!(set.get(Category::Booking).limits.max_entries, 5);
    assert_eq!(set.get(Category::User).limits, PartitionLimits::defaults_for(Category::User));
  }
}
