//! Managed heap of the stub interpreter.
//!
//! Holds the reference-type objects a stub touches: strings, arrays, string builders, handle
//! wrappers, delegates and instances of layout classes. Objects are never collected; a
//! [`HeapRef`] stays valid for the lifetime of the heap.

use std::sync::Arc;

use widestring::{U16Str, U16String};

use crate::{
    emulation::{EmulationError, HeapRef, StubValue},
    metadata::typesystem::{MarshalType, StructDesc},
    Result,
};

/// Object stored on the managed heap.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    /// A string as UTF-16 code units
    String(U16String),
    /// A single-dimensional array
    Array {
        /// Declared element type
        element: MarshalType,
        /// The elements
        items: Vec<StubValue>,
    },
    /// `System.Text.StringBuilder`
    StringBuilder {
        /// Current contents
        contents: U16String,
        /// Capacity in characters
        capacity: usize,
    },
    /// A `SafeHandle` subclass instance
    SafeHandle {
        /// Declared type name
        type_name: String,
        /// The wrapped native handle
        handle: i64,
        /// `DangerousAddRef` count minus `DangerousRelease` count
        ref_count: i32,
    },
    /// A `CriticalHandle` subclass instance
    CriticalHandle {
        /// Declared type name
        type_name: String,
        /// The wrapped native handle
        handle: i64,
    },
    /// A delegate with its native-callable entry point
    Delegate {
        /// Declared delegate type
        type_name: String,
        /// Function pointer handed to native code
        function: i64,
    },
    /// Instance of a class with field layout
    Object {
        /// Class layout
        desc: Arc<StructDesc>,
        /// Field values in declaration order
        fields: Vec<StubValue>,
    },
}

impl HeapObject {
    /// Short name of the object kind, used in diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "string",
            HeapObject::Array { .. } => "array",
            HeapObject::StringBuilder { .. } => "StringBuilder",
            HeapObject::SafeHandle { .. } => "SafeHandle",
            HeapObject::CriticalHandle { .. } => "CriticalHandle",
            HeapObject::Delegate { .. } => "delegate",
            HeapObject::Object { .. } => "object",
        }
    }
}

fn mismatch(expected: &'static str, found: &HeapObject) -> crate::Error {
    EmulationError::HeapTypeMismatch {
        expected,
        found: found.kind_name(),
    }
    .into()
}

/// Arena of managed objects.
#[derive(Debug, Clone, Default)]
pub struct ManagedHeap {
    objects: Vec<HeapObject>,
}

impl ManagedHeap {
    /// Create an empty heap.
    #[must_use]
    pub fn new() -> Self {
        ManagedHeap::default()
    }

    /// Store `object` and return its reference.
    pub fn alloc(&mut self, object: HeapObject) -> HeapRef {
        self.objects.push(object);
        HeapRef::new(self.objects.len() as u64 - 1)
    }

    /// Number of objects ever allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing was allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The object behind `reference`.
    ///
    /// # Errors
    /// [`EmulationError::InvalidHeapReference`] for a reference this heap never handed out.
    pub fn get(&self, reference: HeapRef) -> Result<&HeapObject> {
        usize::try_from(reference.id())
            .ok()
            .and_then(|index| self.objects.get(index))
            .ok_or_else(|| {
                EmulationError::InvalidHeapReference {
                    reference_id: reference.id(),
                }
                .into()
            })
    }

    /// Mutable access to the object behind `reference`.
    ///
    /// # Errors
    /// [`EmulationError::InvalidHeapReference`] for a reference this heap never handed out.
    pub fn get_mut(&mut self, reference: HeapRef) -> Result<&mut HeapObject> {
        usize::try_from(reference.id())
            .ok()
            .and_then(|index| self.objects.get_mut(index))
            .ok_or_else(|| {
                EmulationError::InvalidHeapReference {
                    reference_id: reference.id(),
                }
                .into()
            })
    }

    /// Contents of a string object.
    ///
    /// # Errors
    /// Fails if `reference` is not a string.
    pub fn string(&self, reference: HeapRef) -> Result<&U16Str> {
        match self.get(reference)? {
            HeapObject::String(text) => Ok(text),
            other => Err(mismatch("string", other)),
        }
    }

    /// Element type and elements of an array object.
    ///
    /// # Errors
    /// Fails if `reference` is not an array.
    pub fn array(&self, reference: HeapRef) -> Result<(&MarshalType, &[StubValue])> {
        match self.get(reference)? {
            HeapObject::Array { element, items } => Ok((element, items)),
            other => Err(mismatch("array", other)),
        }
    }

    /// Mutable elements of an array object.
    ///
    /// # Errors
    /// Fails if `reference` is not an array.
    pub fn array_mut(&mut self, reference: HeapRef) -> Result<(&MarshalType, &mut Vec<StubValue>)> {
        match self.get_mut(reference)? {
            HeapObject::Array { element, items } => Ok((element, items)),
            other => Err(mismatch("array", other)),
        }
    }

    /// Layout and mutable fields of a class instance.
    ///
    /// # Errors
    /// Fails if `reference` is not a class instance.
    pub fn object_mut(
        &mut self,
        reference: HeapRef,
    ) -> Result<(&Arc<StructDesc>, &mut Vec<StubValue>)> {
        match self.get_mut(reference)? {
            HeapObject::Object { desc, fields } => Ok((desc, fields)),
            other => Err(mismatch("object", other)),
        }
    }

    /// Contents and capacity of a string builder.
    ///
    /// # Errors
    /// Fails if `reference` is not a string builder.
    pub fn string_builder(&self, reference: HeapRef) -> Result<(&U16Str, usize)> {
        match self.get(reference)? {
            HeapObject::StringBuilder { contents, capacity } => Ok((contents, *capacity)),
            other => Err(mismatch("StringBuilder", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_lookup() {
        let mut heap = ManagedHeap::new();
        let text = heap.alloc(HeapObject::String(U16String::from_str("abc")));
        let array = heap.alloc(HeapObject::Array {
            element: MarshalType::I4,
            items: vec![StubValue::I4(1)],
        });

        assert_eq!(heap.len(), 2);
        assert_eq!(heap.string(text).unwrap().to_string_lossy(), "abc");
        assert_eq!(heap.array(array).unwrap().1, &[StubValue::I4(1)]);
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let mut heap = ManagedHeap::new();
        let text = heap.alloc(HeapObject::String(U16String::new()));
        assert!(matches!(
            heap.array(text),
            Err(crate::Error::Emulation(EmulationError::HeapTypeMismatch {
                expected: "array",
                found: "string"
            }))
        ));
        assert!(heap.get(HeapRef::new(9)).is_err());
    }
}
