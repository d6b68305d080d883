//! A keyed hash map over the SIMD-probed [`HashTable`].
//!
//! [`HashMap<K, V, S>`] stores key-value pairs where keys implement
//! `Hash + Eq`, using a configurable [`BuildHasher`] to digest keys. The
//! default hasher is this crate's [`DefaultHashBuilder`]. The underlying
//! storage is the control-byte table provided by
//! [`HashTable`](crate::hash_table::HashTable).

use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::ops::Index;

use crate::hash::DefaultHashBuilder;
use crate::hash_table::Entry as TableEntry;
use crate::hash_table::HashTable;
use crate::hash_table::TryReserveError;

/// A hash map backed by the SIMD-probed [`HashTable`].
///
/// Note that [`insert`] has first-writer-wins semantics: inserting a key
/// that is already present leaves the stored value untouched and reports
/// `false`. Replace values through [`get_mut`] or the [`entry`] API.
///
/// References into the map are invalidated by any operation that may
/// insert (the table can rebuild its storage); the borrow checker enforces
/// this.
///
/// [`insert`]: HashMap::insert
/// [`get_mut`]: HashMap::get_mut
/// [`entry`]: HashMap::entry
#[derive(Clone)]
pub struct HashMap<K, V, S = DefaultHashBuilder> {
    table: HashTable<(K, V)>,
    hash_builder: S,
}

impl<K, V, S> Debug for HashMap<K, V, S>
where
    K: Debug + Hash + Eq,
    V: Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(k, v);
        }
        map.finish()
    }
}

impl<K, V> HashMap<K, V, DefaultHashBuilder>
where
    K: Hash + Eq,
{
    /// Creates an empty map.
    ///
    /// Nothing is allocated until the first insertion.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let map: HashMap<i32, String> = HashMap::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }

    /// Creates an empty map with at least the requested slot capacity.
    ///
    /// The capacity is rounded up to a power of two of at least 16.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let map: HashMap<i32, String> = HashMap::with_capacity(100);
    /// assert!(map.capacity() >= 100);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an empty map using the given hasher builder.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_capacity_and_hasher(0, hash_builder)
    }

    /// Creates an empty map with the requested slot capacity and the given
    /// hasher builder.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self {
            table: HashTable::with_capacity(capacity),
            hash_builder,
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// assert_eq!(map.len(), 0);
    /// map.insert(1, "a");
    /// assert_eq!(map.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the number of allocated slots.
    ///
    /// This is zero or a power of two of at least 16; the map rebuilds its
    /// storage when `len` would exceed 7/8 of it.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Removes all entries, retaining the allocated capacity.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// map.clear();
    /// assert!(map.is_empty());
    /// ```
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Returns a reference to the value stored for `key`, if any.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.get(&1), Some(&"a"));
    /// assert_eq!(map.get(&2), None);
    /// ```
    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = self.hash_builder.hash_one(key);
        self.table.find(hash, |(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns a mutable reference to the value stored for `key`, if any.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, 10);
    /// if let Some(value) = map.get_mut(&1) {
    ///     *value += 1;
    /// }
    /// assert_eq!(map.get(&1), Some(&11));
    /// ```
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let hash = self.hash_builder.hash_one(key);
        self.table.find_mut(hash, |(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns the stored key and value for `key`, if any.
    pub fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        let hash = self.hash_builder.hash_one(key);
        self.table.find(hash, |(k, _)| k == key).map(|(k, v)| (k, v))
    }

    /// Returns `true` if the map contains an entry for `key`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// assert!(map.contains_key(&1));
    /// assert!(!map.contains_key(&2));
    /// ```
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts a key-value pair if the key is not already present.
    ///
    /// Returns `true` if the entry was inserted. If the key is already
    /// present the map is unchanged, the given key and value are dropped,
    /// and `false` is returned; replace values through [`get_mut`] or the
    /// [`entry`] API.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// assert!(map.insert(1, "a"));
    /// assert!(!map.insert(1, "b"));
    /// assert_eq!(map.get(&1), Some(&"a"));
    /// ```
    ///
    /// [`get_mut`]: HashMap::get_mut
    /// [`entry`]: HashMap::entry
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let hash = self.hash_builder.hash_one(&key);
        let hash_builder = &self.hash_builder;
        match self.table.entry(
            hash,
            |(k, _)| k == &key,
            |(k, _)| hash_builder.hash_one(k),
        ) {
            TableEntry::Occupied(_) => false,
            TableEntry::Vacant(entry) => {
                entry.insert((key, value));
                true
            }
        }
    }

    /// Removes the entry for `key`, returning its value if one was
    /// present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove(&1), Some("a"));
    /// assert_eq!(map.remove(&1), None);
    /// ```
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = self.hash_builder.hash_one(key);
        self.table.remove(hash, |(k, _)| k == key).map(|(_, v)| v)
    }

    /// Removes the entry for `key`, returning the owned key-value pair if
    /// one was present.
    ///
    /// The pair is detached from the map and can be reinserted later with
    /// [`insert`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.remove_entry(&1), Some((1, "a")));
    /// assert_eq!(map.remove_entry(&1), None);
    /// ```
    ///
    /// [`insert`]: HashMap::insert
    pub fn remove_entry(&mut self, key: &K) -> Option<(K, V)> {
        let hash = self.hash_builder.hash_one(key);
        self.table.remove(hash, |(k, _)| k == key)
    }

    /// Retains only the entries for which the predicate returns `true`.
    ///
    /// Visits every entry exactly once; rejected entries are erased as if
    /// by [`remove`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// for i in 0..8 {
    ///     map.insert(i, i * 10);
    /// }
    /// map.retain(|&k, _| k % 2 == 0);
    /// assert_eq!(map.len(), 4);
    /// ```
    ///
    /// [`remove`]: HashMap::remove
    pub fn retain(&mut self, mut f: impl FnMut(&K, &mut V) -> bool) {
        self.table.retain(|(k, v)| f(k, v));
    }

    /// Gets the entry for `key` for in-place manipulation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.entry(1).or_insert("a");
    /// map.entry(1).or_insert("b");
    /// assert_eq!(map.get(&1), Some(&"a"));
    /// ```
    pub fn entry(&mut self, key: K) -> Entry<'_, K, V> {
        let hash = self.hash_builder.hash_one(&key);
        let hash_builder = &self.hash_builder;
        match self.table.entry(
            hash,
            |(k, _)| k == &key,
            |(k, _)| hash_builder.hash_one(k),
        ) {
            TableEntry::Occupied(entry) => Entry::Occupied(OccupiedEntry { entry }),
            TableEntry::Vacant(entry) => Entry::Vacant(VacantEntry { entry, key }),
        }
    }

    /// Reserves capacity for at least `additional` more entries.
    pub fn reserve(&mut self, additional: usize) {
        let hash_builder = &self.hash_builder;
        self.table
            .reserve(additional, |(k, _)| hash_builder.hash_one(k));
    }

    /// Fallible [`reserve`]: reports allocation failure instead of
    /// aborting. On error the map is unchanged.
    ///
    /// [`reserve`]: HashMap::reserve
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let hash_builder = &self.hash_builder;
        self.table
            .try_reserve(additional, |(k, _)| hash_builder.hash_one(k))
    }

    /// Shrinks the map's storage to the smallest capacity that holds its
    /// current entries, deallocating entirely when empty.
    pub fn shrink_to_fit(&mut self) {
        let hash_builder = &self.hash_builder;
        self.table
            .shrink_to_fit(|(k, _)| hash_builder.hash_one(k));
    }

    /// Returns an iterator over the map's key-value pairs.
    ///
    /// The order is unspecified and may change after any mutation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probemap::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.insert(1, "a");
    /// map.insert(2, "b");
    /// assert_eq!(map.iter().count(), 2);
    /// ```
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.table.iter(),
        }
    }

    /// Returns an iterator over the map's keys.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { inner: self.iter() }
    }

    /// Returns an iterator over the map's values.
    pub fn values(&self) -> Values<'_, K, V> {
        Values { inner: self.iter() }
    }
}

impl<K, V, S> Index<&K> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    type Output = V;

    /// Returns a reference to the value stored for `key`.
    ///
    /// # Panics
    ///
    /// Panics if the key is not present in the map.
    fn index(&self, key: &K) -> &V {
        self.get(key).expect("key not found in map")
    }
}

/// A view into a single entry in the map, which may be vacant or occupied.
///
/// Constructed by the [`entry`] method on [`HashMap`].
///
/// [`entry`]: HashMap::entry
pub enum Entry<'a, K, V> {
    /// The key is not present.
    Vacant(VacantEntry<'a, K, V>),
    /// The key is present.
    Occupied(OccupiedEntry<'a, K, V>),
}

impl<'a, K, V> Entry<'a, K, V> {
    /// Inserts `default` if the entry is vacant; returns a mutable
    /// reference to the value either way.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts the closure's value if the entry is vacant; returns a
    /// mutable reference to the value either way.
    pub fn or_insert_with<F>(self, default: F) -> &'a mut V
    where
        F: FnOnce() -> V,
    {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Provides in-place mutable access to an occupied entry before any
    /// potential insertion.
    pub fn and_modify<F>(self, f: F) -> Self
    where
        F: FnOnce(&mut V),
    {
        match self {
            Entry::Occupied(mut entry) => {
                f(entry.get_mut());
                Entry::Occupied(entry)
            }
            Entry::Vacant(entry) => Entry::Vacant(entry),
        }
    }

    /// Returns a reference to this entry's key.
    pub fn key(&self) -> &K {
        match self {
            Entry::Occupied(entry) => entry.key(),
            Entry::Vacant(entry) => entry.key(),
        }
    }
}

impl<'a, K, V> Entry<'a, K, V>
where
    V: Default,
{
    /// Inserts `V::default()` if the entry is vacant; returns a mutable
    /// reference to the value either way.
    pub fn or_default(self) -> &'a mut V {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the map.
pub struct VacantEntry<'a, K, V> {
    entry: crate::hash_table::VacantEntry<'a, (K, V)>,
    key: K,
}

impl<'a, K, V> VacantEntry<'a, K, V> {
    /// Gets a reference to the key that would be used when inserting.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Takes ownership of the key.
    pub fn into_key(self) -> K {
        self.key
    }

    /// Inserts the value and returns a mutable reference to it.
    pub fn insert(self, value: V) -> &'a mut V {
        &mut self.entry.insert((self.key, value)).1
    }
}

/// A view into an occupied entry in the map.
pub struct OccupiedEntry<'a, K, V> {
    entry: crate::hash_table::OccupiedEntry<'a, (K, V)>,
}

impl<'a, K, V> OccupiedEntry<'a, K, V> {
    /// Gets a reference to the key in the entry.
    pub fn key(&self) -> &K {
        &self.entry.get().0
    }

    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        &self.entry.get().1
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        &mut self.entry.get_mut().1
    }

    /// Converts the entry into a mutable reference to the value.
    pub fn into_mut(self) -> &'a mut V {
        &mut self.entry.into_mut().1
    }

    /// Replaces the value in the entry, returning the previous value.
    pub fn insert(&mut self, value: V) -> V {
        core::mem::replace(&mut self.entry.get_mut().1, value)
    }

    /// Removes the entry from the map and returns the value.
    pub fn remove(self) -> V {
        self.entry.remove().1
    }

    /// Removes the entry from the map and returns the key and value.
    pub fn remove_entry(self) -> (K, V) {
        self.entry.remove()
    }
}

/// An iterator over the key-value pairs of a [`HashMap`].
pub struct Iter<'a, K, V> {
    inner: crate::hash_table::Iter<'a, (K, V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k, v))
    }
}

/// An iterator over the keys of a [`HashMap`].
pub struct Keys<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

/// An iterator over the values of a [`HashMap`].
pub struct Values<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }
}
