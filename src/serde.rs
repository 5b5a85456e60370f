use super::{Builder, CacheMap, EvictionPolicy};

use serde::de::{Deserialize, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserializer;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

pub struct CacheMapVisitor<K, V, H: BuildHasher> {
    #[allow(clippy::type_complexity)]
    marker: PhantomData<fn() -> CacheMap<K, V, H>>,
}

impl<K, V, H: BuildHasher> CacheMapVisitor<K, V, H> {
    fn new() -> Self {
        CacheMapVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, K, V, H> Visitor<'de> for CacheMapVisitor<K, V, H>
where
    K: 'static + Clone + Deserialize<'de> + Eq + Hash,
    V: 'static + Clone + Deserialize<'de>,
    H: BuildHasher + Default,
{
    type Value = CacheMap<K, V, H>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a CacheMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        // Deserialization cannot know the original bound, so the restored map is unbounded;
        // callers move the entries into a bounded map when one is needed.
        let Ok(map) = Builder::new(u64::MAX)
            .eviction_policy(EvictionPolicy::None)
            .initial_capacity(access.size_hint().unwrap_or(0))
            .build_hasher(H::default())
            .build()
        else {
            return Err(serde::de::Error::custom("configuration"));
        };

        while let Some((key, value)) = access.next_entry()? {
            let _ = map.put(key, value);
        }

        Ok(map)
    }
}

impl<'de, K, V, H> Deserialize<'de> for CacheMap<K, V, H>
where
    K: 'static + Clone + Deserialize<'de> + Eq + Hash,
    V: 'static + Clone + Deserialize<'de>,
    H: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(CacheMapVisitor::<K, V, H>::new())
    }
}

impl<K, V, H> Serialize for CacheMap<K, V, H>
where
    K: 'static + Clone + Eq + Hash + Serialize,
    V: 'static + Clone + Serialize,
    H: BuildHasher,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        let mut error = None;
        self.scan(|k, v| {
            if error.is_none() {
                if let Err(e) = map.serialize_entry(k, v) {
                    error.replace(e);
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        map.end()
    }
}

#[cfg(test)]
mod serde_test {
    use crate::CacheMap;

    use serde_test::{assert_tokens, Token};

    #[test]
    fn serde_cache_map() {
        let map: CacheMap<u64, i16> = CacheMap::with_maximum_size(64);
        assert!(map.put(2, -6).is_none());
        assert_tokens(
            &map,
            &[
                Token::Map { len: Some(1) },
                Token::U64(2),
                Token::I16(-6),
                Token::MapEnd,
            ],
        );
    }
}
