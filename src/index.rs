/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Arena indices for graph entities and machine resources.

#[macro_export]
macro_rules! define_index {
    ($ix:ident, $storage:ident, $elem:ident) => {
        define_index!($ix);

        #[derive(Clone, Debug, Default)]
        pub struct $storage {
            storage: alloc::vec::Vec<$elem>,
        }

        impl $storage {
            #[inline(always)]
            pub fn with_capacity(n: usize) -> Self {
                Self {
                    storage: alloc::vec::Vec::with_capacity(n),
                }
            }

            #[inline(always)]
            pub fn len(&self) -> usize {
                self.storage.len()
            }

            #[inline(always)]
            pub fn is_empty(&self) -> bool {
                self.storage.is_empty()
            }

            #[inline(always)]
            pub fn iter(&self) -> impl Iterator<Item = &$elem> {
                self.storage.iter()
            }

            #[inline(always)]
            pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut $elem> {
                self.storage.iter_mut()
            }

            /// All ids handed out so far, in allocation order.
            #[inline(always)]
            pub fn ids(&self) -> impl Iterator<Item = $ix> + Clone {
                (0..self.storage.len()).map($ix::new)
            }

            #[inline(always)]
            pub fn push(&mut self, value: $elem) -> $ix {
                let idx = $ix(self.storage.len() as u32);
                self.storage.push(value);
                idx
            }
        }

        impl core::ops::Index<$ix> for $storage {
            type Output = $elem;

            #[inline(always)]
            fn index(&self, i: $ix) -> &Self::Output {
                &self.storage[i.index()]
            }
        }

        impl core::ops::IndexMut<$ix> for $storage {
            #[inline(always)]
            fn index_mut(&mut self, i: $ix) -> &mut Self::Output {
                &mut self.storage[i.index()]
            }
        }

        impl<'a> IntoIterator for &'a $storage {
            type Item = &'a $elem;
            type IntoIter = core::slice::Iter<'a, $elem>;

            #[inline(always)]
            fn into_iter(self) -> Self::IntoIter {
                self.storage.iter()
            }
        }
    };

    ($ix:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(
            feature = "enable-serde",
            derive(::serde::Serialize, ::serde::Deserialize)
        )]
        pub struct $ix(pub u32);
        impl $ix {
            #[inline(always)]
            pub fn new(i: usize) -> Self {
                Self(i as u32)
            }
            #[inline(always)]
            pub fn index(self) -> usize {
                debug_assert!(self.is_valid());
                self.0 as usize
            }
            #[inline(always)]
            pub fn invalid() -> Self {
                Self(u32::MAX)
            }
            #[inline(always)]
            pub fn is_invalid(self) -> bool {
                self == Self::invalid()
            }
            #[inline(always)]
            pub fn is_valid(self) -> bool {
                self != Self::invalid()
            }
            #[inline(always)]
            pub fn raw_u32(self) -> u32 {
                self.0
            }
        }
    };
}

define_index!(BlockId);
define_index!(RfId);
define_index!(FuId);
define_index!(BusId);

#[cfg(test)]
mod test {
    use alloc::vec::Vec;

    use super::*;

    #[derive(Clone, Debug, Default)]
    pub struct Item(pub u8);
    define_index!(ItemId, Items, Item);

    #[test]
    fn storage_hands_out_sequential_ids() {
        let mut items = Items::default();
        assert!(items.is_empty());
        let a = items.push(Item(1));
        let b = items.push(Item(2));
        assert_eq!(a, ItemId::new(0));
        assert_eq!(b, ItemId::new(1));
        items[b].0 = 7;
        assert_eq!(items.ids().collect::<Vec<_>>(), [a, b]);
        assert_eq!(items.iter().map(|i| i.0).collect::<Vec<_>>(), [1, 7]);
    }

    #[test]
    fn invalid_ids() {
        assert!(RfId::invalid().is_invalid());
        assert!(RfId::new(3).is_valid());
        assert_eq!(BusId::new(3).index(), 3);
    }
}
