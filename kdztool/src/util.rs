/*
 * SPDX-FileCopyrightText: 2024-2025 kdztool contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fmt, marker::PhantomData, str::FromStr};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
};

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Check if a byte slice is all zeros.
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

pub trait NulPadding {
    /// Trim the slice to the bytes before the first NUL. The whole slice is
    /// returned if it contains no NUL byte.
    fn trim_to_nul(&self) -> &[u8];

    /// Return the slice as an array padded with zeros at the end.
    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]>;
}

impl NulPadding for [u8] {
    fn trim_to_nul(&self) -> &[u8] {
        let len = self.iter().position(|b| *b == 0).unwrap_or(self.len());

        &self[..len]
    }

    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]> {
        if self.len() > N {
            return None;
        }

        let mut result = [0u8; N];
        result[..self.len()].copy_from_slice(self);

        Some(result)
    }
}

/// An ordered two-level grouping: group key -> entry name -> items. Both
/// levels preserve first-appearance order, which is part of the on-disk hash
/// contract, so this is intentionally not backed by a hash map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderedGroups<K, T> {
    groups: Vec<(K, Vec<(String, Vec<T>)>)>,
}

impl<K: Copy + PartialEq, T> OrderedGroups<K, T> {
    pub fn new() -> Self {
        Self { groups: vec![] }
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.groups.iter().any(|(k, _)| *k == key)
    }

    pub fn contains_entry(&self, key: K, name: &str) -> bool {
        self.groups
            .iter()
            .find(|(k, _)| *k == key)
            .is_some_and(|(_, entries)| entries.iter().any(|(n, _)| n == name))
    }

    /// Append an item, creating the group and entry on first appearance.
    pub fn push(&mut self, key: K, name: &str, item: T) {
        let entries = match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, entries)) => entries,
            None => {
                self.groups.push((key, vec![]));
                &mut self.groups.last_mut().unwrap().1
            }
        };

        match entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, items)) => items.push(item),
            None => entries.push((name.to_owned(), vec![item])),
        }
    }

    pub fn groups(&self) -> &[(K, Vec<(String, Vec<T>)>)] {
        &self.groups
    }

    /// Iterate over every (key, name, items) entry in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (K, &str, &[T])> {
        self.groups.iter().flat_map(|(key, entries)| {
            entries
                .iter()
                .map(|(name, items)| (*key, name.as_str(), items.as_slice()))
        })
    }

    /// Total number of items across all groups and entries.
    pub fn len(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|(_, entries)| entries.iter())
            .map(|(_, items)| items.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl<K: Copy + PartialEq, T> Default for OrderedGroups<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

struct EntriesRef<'a, T>(&'a [(String, Vec<T>)]);

impl<T: Serialize> Serialize for EntriesRef<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;

        for (name, items) in self.0 {
            map.serialize_entry(name, items)?;
        }

        map.end()
    }
}

impl<K: Copy + fmt::Display, T: Serialize> Serialize for OrderedGroups<K, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;

        for (key, entries) in &self.groups {
            map.serialize_entry(&key.to_string(), &EntriesRef(entries))?;
        }

        map.end()
    }
}

struct Entries<T>(Vec<(String, Vec<T>)>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Entries<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of names to item lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));

                while let Some((name, items)) = access.next_entry::<String, Vec<T>>()? {
                    entries.push((name, items));
                }

                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

impl<'de, K, T> Deserialize<'de> for OrderedGroups<K, T>
where
    K: Copy + PartialEq + FromStr,
    K::Err: fmt::Display,
    T: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct GroupsVisitor<K, T>(PhantomData<(K, T)>);

        impl<'de, K, T> Visitor<'de> for GroupsVisitor<K, T>
        where
            K: Copy + PartialEq + FromStr,
            K::Err: fmt::Display,
            T: Deserialize<'de>,
        {
            type Value = OrderedGroups<K, T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of group keys to entry maps")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut groups = Vec::with_capacity(access.size_hint().unwrap_or(0));

                while let Some((key, entries)) = access.next_entry::<String, Entries<T>>()? {
                    let key = K::from_str(&key).map_err(de::Error::custom)?;
                    groups.push((key, entries.0));
                }

                Ok(OrderedGroups { groups })
            }
        }

        deserializer.deserialize_map(GroupsVisitor(PhantomData))
    }
}
