use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;

/// A value together with its fxhash fingerprint.
pub struct Hashed<T> {
	value: T,
	hash: u64,
}

impl<T: Hash> Hashed<T> {
	pub fn new(value: T) -> Self {
		let hash = fxhash::hash64(&value);
		Self { value, hash }
	}

	/// Replaces the value. Returns `false` when the fingerprint is unchanged.
	pub fn replace(&mut self, value: T) -> bool {
		let next = Hashed::new(value);
		let changed = next.hash != self.hash;
		*self = next;
		changed
	}
}

impl<T> Hashed<T> {
	pub fn hash(&self) -> u64 {
		self.hash
	}
}

impl<T: Hash + Default> Default for Hashed<T> {
	fn default() -> Self {
		Hashed::new(T::default())
	}
}

impl<T> Deref for Hashed<T> {
	type Target = T;
	fn deref(&self) -> &Self::Target {
		&self.value
	}
}

impl<T> Debug for Hashed<T>
where
	T: Debug,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.value.fmt(f)
	}
}
