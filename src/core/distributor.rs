
use std::hash::Hash;

use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Order in which the pairs of the different job spaces are handed to the backend.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DistributionPolicy {
  /// Every pair of the first space, then every pair of the second, and so on.
  DepthFirst,
  /// One pair from each space in turn until all spaces are exhausted.
  #[default]
  RoundRobin,
}

/// Flattens the per-space lists into one dispatch sequence. Every element appears exactly
/// once; spaces are visited in the map's insertion order.
pub fn distribute<K, T>(groups: LinkedHashMap<K, Vec<T>>, policy: DistributionPolicy) -> Vec<T>
where
  K: Hash + Eq,
{
  let total = groups.values().map(Vec::len).sum();
  let mut ordered = Vec::with_capacity(total);

  match policy {
    DistributionPolicy::DepthFirst => {
      for (_, group) in groups {
        ordered.extend(group);
      }
    }
    DistributionPolicy::RoundRobin => {
      let mut iterators: Vec<_> = groups.into_iter().map(|(_, g)| g.into_iter()).collect();
      while ordered.len() < total {
        for iterator in iterators.iter_mut() {
          if let Some(item) = iterator.next() {
            ordered.push(item);
          }
        }
        iterators.retain(|iterator| iterator.len() > 0);
      }
    }
  }
  ordered
}
