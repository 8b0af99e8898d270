//! Addresses of word-sized memory cells.
//!
//! References (`T&`), the register after `LdV`/`LdG`, and pointers produced by
//! `Psf`/`Pga`/`AddSi` are addresses. They are stored in memory as two words
//! with a tag in the top four bits; the all-zero value is null.

use super::heap::ObjectRef;
use super::module::ModuleId;
use super::stack::StackPtr;

const TAG_SHIFT: u32 = 60;
const TAG_STACK: u64 = 1;
const TAG_GLOBAL: u64 = 2;
const TAG_FIELD: u64 = 3;
const TAG_STRING: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Null,
    /// A slot in a context's stack.
    Stack(StackPtr),
    /// A word of a module's global store.
    Global { module: ModuleId, offset: u32 },
    /// A field of a heap object. Only the low 16 bits of the generation are
    /// kept.
    Field {
        index: u32,
        generation: u16,
        offset: u32,
    },
    /// A constant string. Only host functions can read through it.
    Str { module: ModuleId, index: u32 },
}

impl Address {
    pub fn field(object: ObjectRef, offset: u32) -> Address {
        Address::Field {
            index: object.index(),
            generation: object.generation() as u16,
            offset,
        }
    }

    /// The address `words` words further on; `None` for null and strings.
    pub fn add_words(self, words: u32) -> Option<Address> {
        match self {
            Address::Null | Address::Str { .. } => None,
            Address::Stack(ptr) => ptr.offset_by(words as i64).map(Address::Stack),
            Address::Global { module, offset } => Some(Address::Global {
                module,
                offset: offset.checked_add(words)?,
            }),
            Address::Field {
                index,
                generation,
                offset,
            } => Some(Address::Field {
                index,
                generation,
                offset: offset.checked_add(words)?,
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Address::Null)
    }

    pub fn to_bits(self) -> u64 {
        match self {
            Address::Null => 0,
            Address::Stack(ptr) => {
                (TAG_STACK << TAG_SHIFT) | ((ptr.block as u64 & 0xffff) << 32) | ptr.offset as u64
            }
            Address::Global { module, offset } => {
                (TAG_GLOBAL << TAG_SHIFT) | ((module.0 as u64 & 0xffff) << 32) | offset as u64
            }
            Address::Field {
                index,
                generation,
                offset,
            } => {
                (TAG_FIELD << TAG_SHIFT)
                    | ((index as u64 & 0xff_ffff) << 36)
                    | ((generation as u64) << 20)
                    | (offset as u64 & 0xf_ffff)
            }
            Address::Str { module, index } => {
                (TAG_STRING << TAG_SHIFT) | ((module.0 as u64 & 0xffff) << 32) | index as u64
            }
        }
    }

    /// Decodes an address; unknown tags decode as `None`.
    pub fn from_bits(bits: u64) -> Option<Address> {
        let tag = bits >> TAG_SHIFT;
        let high16 = ((bits >> 32) & 0xffff) as u32;
        let low32 = bits as u32;
        Some(match tag {
            0 if bits == 0 => Address::Null,
            TAG_STACK => Address::Stack(StackPtr {
                block: high16,
                offset: low32,
            }),
            TAG_GLOBAL => Address::Global {
                module: ModuleId(high16),
                offset: low32,
            },
            TAG_FIELD => Address::Field {
                index: ((bits >> 36) & 0xff_ffff) as u32,
                generation: ((bits >> 20) & 0xffff) as u16,
                offset: (bits & 0xf_ffff) as u32,
            },
            TAG_STRING => Address::Str {
                module: ModuleId(high16),
                index: low32,
            },
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        let cases = [
            Address::Null,
            Address::Stack(StackPtr {
                block: 3,
                offset: 1021,
            }),
            Address::Global {
                module: ModuleId(2),
                offset: 17,
            },
            Address::Field {
                index: 40_000,
                generation: 9,
                offset: 3,
            },
            Address::Str {
                module: ModuleId(1),
                index: 0,
            },
        ];
        for addr in cases {
            assert_eq!(Address::from_bits(addr.to_bits()), Some(addr));
        }
        assert_eq!(Address::Null.to_bits(), 0);
    }

    #[test]
    fn test_add_words() {
        let global = Address::Global {
            module: ModuleId(1),
            offset: 4,
        };
        assert_eq!(
            global.add_words(1),
            Some(Address::Global {
                module: ModuleId(1),
                offset: 5
            })
        );
        assert_eq!(Address::Null.add_words(1), None);
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(Address::from_bits(0xf << 60), None);
        assert_eq!(Address::from_bits(5), None);
    }
}
