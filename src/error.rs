use thiserror::Error;

use crate::{
    emulation::EmulationError,
    interop::{MarshalDirection, MarshallerKind, RuntimeHelper},
};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into two groups. Generation-time errors are raised while a stub is being built:
/// the marshalling combination is unsupported, the metadata is inconsistent, or a descriptor
/// blob is malformed. Execution-time errors are raised by the [`crate::emulation`] runtime while
/// a generated stub runs against concrete values.
///
/// # Error Categories
///
/// ## Generation Errors
/// - [`Error::NotSupported`] - The kind cannot be marshalled in the requested direction/role
/// - [`Error::InvalidConfiguration`] - Marshalling metadata is inconsistent (`SizeParamIndex`)
/// - [`Error::InvalidHomeStore`] - A value was stored into a read-only home
/// - [`Error::UndefinedLabel`] - A branch targets a label that was never placed
/// - [`Error::HelperNotFound`] - A runtime helper could not be resolved
///
/// ## Descriptor Parsing Errors
/// - [`Error::Malformed`] - Corrupted `MarshalAs` blob
/// - [`Error::OutOfBounds`] - Attempted to read beyond the blob
/// - [`Error::RecursionLimit`] - Nested descriptor exceeds the nesting limit
///
/// ## Execution Errors
/// - [`Error::AllocationOverflow`] - Native buffer size computation overflowed
/// - [`Error::UnmappableChar`] - A character has no ANSI mapping under a throwing policy
/// - [`Error::Emulation`] - Interpreter fault (bad pointer, null reference, limits)
///
/// # Examples
///
/// ```rust
/// use dotmarshal::{Error, MarshalAsDescriptor};
///
/// match MarshalAsDescriptor::parse(&[0x2A, 0x80]) {
///     Ok(descriptor) => println!("parsed {:?}", descriptor.native_type()),
///     Err(Error::OutOfBounds) => eprintln!("truncated descriptor"),
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The descriptor blob is damaged and could not be parsed.
    ///
    /// This error indicates that the input data doesn't conform to the
    /// ECMA-335 `MarshalAs` blob layout.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing a blob.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Reached the maximum nesting depth allowed.
    ///
    /// Raised when a nested array descriptor or a recursive struct layout goes deeper than the
    /// configured limit. The associated value shows the limit that was hit.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// The marshaller kind cannot be emitted in the requested direction or role.
    ///
    /// Raised when stub generation reaches a kind that has no emission support (VARIANT,
    /// by-value fixed buffers, `AsAny`) or a supported kind used in a way it does not allow
    /// (an out `LPStruct` pointer, a reverse `SafeHandle`).
    #[error("Marshalling '{managed_type}' as {kind} is not supported ({direction}): {reason}")]
    NotSupported {
        /// The classified marshaller kind
        kind: MarshallerKind,
        /// Display name of the managed type being marshalled
        managed_type: String,
        /// The direction the stub was being generated for
        direction: MarshalDirection,
        /// Why the combination was rejected
        reason: &'static str,
    },

    /// Marshalling metadata is inconsistent.
    ///
    /// Raised for a `SizeParamIndex` that is out of range or that names a non-integral
    /// parameter.
    #[error("Invalid marshalling configuration - {0}")]
    InvalidConfiguration(String),

    /// The byte size of a native buffer overflowed.
    #[error("Native allocation size overflowed: {count} * {element_size}")]
    AllocationOverflow {
        /// Number of elements requested
        count: i64,
        /// Native size of one element
        element_size: i64,
    },

    /// A character has no representation in the target encoding and the policy demands a throw.
    #[error("Character U+{code_point:04X} cannot be represented in {encoding}")]
    UnmappableChar {
        /// The UTF-16 code unit that failed to map
        code_point: u32,
        /// Name of the target encoding
        encoding: &'static str,
    },

    /// A value was stored into a home that only supports loads.
    #[error("Cannot store into a {0} home")]
    InvalidHomeStore(&'static str),

    /// A branch references a label that was never placed in any code stream.
    #[error("Label {0} is referenced but never placed")]
    UndefinedLabel(u32),

    /// A runtime helper could not be resolved.
    #[error("Failed to resolve runtime helper {0}")]
    HelperNotFound(RuntimeHelper),

    /// The stub interpreter faulted.
    #[error(transparent)]
    Emulation(#[from] EmulationError),
}
