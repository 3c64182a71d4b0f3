use ethers::abi::Token;
use ethers::types::H256;
use ethers::utils::keccak256;
use itertools::Itertools;
use std::collections::HashMap;

/// Maps a keccak hash of a comma-joined container permutation back to the
/// ordered container-id list.
///
/// The coordinator expresses "run pipeline X" as
/// `keccak256(abi.encode(string(join(ids, ","))))`, so the node precomputes
/// the hash of every ordered permutation of every non-empty subset of its
/// configured containers. Order matters: `a,b` and `b,a` hash differently.
#[derive(Debug, Clone, Default)]
pub struct ContainerLookup {
    map: HashMap<H256, Vec<String>>,
}

impl ContainerLookup {
    pub fn new(container_ids: &[String]) -> Self {
        let mut map = HashMap::new();
        for k in 1..=container_ids.len() {
            for perm in container_ids.iter().permutations(k) {
                let ids: Vec<String> = perm.into_iter().cloned().collect();
                map.insert(hash_containers(&ids), ids);
            }
        }
        tracing::debug!(permutations = map.len(), "container lookup initialized");
        Self { map }
    }

    /// Container ids in pipeline order, or empty when the hash names a
    /// permutation this node does not serve.
    pub fn get(&self, hash: &H256) -> Vec<String> {
        self.map.get(hash).cloned().unwrap_or_default()
    }
}

/// The on-chain encoding of a container pipeline.
pub fn hash_containers(ids: &[String]) -> H256 {
    let joined = ids.join(",");
    H256::from(keccak256(ethers::abi::encode(&[Token::String(joined)])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_every_permutation() {
        let lookup = ContainerLookup::new(&ids(&["a", "b"]));
        assert_eq!(lookup.get(&hash_containers(&ids(&["a", "b"]))), ids(&["a", "b"]));
        assert_eq!(lookup.get(&hash_containers(&ids(&["b", "a"]))), ids(&["b", "a"]));
        assert_eq!(lookup.get(&hash_containers(&ids(&["a"]))), ids(&["a"]));
        assert_eq!(lookup.get(&hash_containers(&ids(&["b"]))), ids(&["b"]));
    }

    #[test]
    fn unknown_hash_is_empty() {
        let lookup = ContainerLookup::new(&ids(&["a", "b"]));
        assert!(lookup.get(&H256::repeat_byte(0x01)).is_empty());
        assert!(lookup.get(&hash_containers(&ids(&["c"]))).is_empty());
    }

    #[test]
    fn zero_containers_yields_empty_map() {
        let lookup = ContainerLookup::new(&[]);
        assert!(lookup.get(&hash_containers(&ids(&["a"]))).is_empty());
    }

    #[test]
    fn three_containers_cover_subsets_of_every_size() {
        let lookup = ContainerLookup::new(&ids(&["a", "b", "c"]));
        // 3 singles + 6 pairs + 6 triples
        assert_eq!(lookup.get(&hash_containers(&ids(&["c", "a"]))), ids(&["c", "a"]));
        assert_eq!(
            lookup.get(&hash_containers(&ids(&["b", "c", "a"]))),
            ids(&["b", "c", "a"])
        );
    }

    #[test]
    fn hash_is_order_sensitive() {
        assert_ne!(
            hash_containers(&ids(&["a", "b"])),
            hash_containers(&ids(&["b", "a"]))
        );
    }
}
