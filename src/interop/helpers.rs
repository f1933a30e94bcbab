//! Runtime helper methods called by generated stubs.
//!
//! Stubs never allocate native memory or transcode strings inline: they call well-known runtime
//! helpers (`CoTaskMemAllocAndZeroMemory`, `StringToAnsiString`, ...). A [`HelperResolver`] maps
//! each [`RuntimeHelper`] to the token of its implementation in the target module. Resolution
//! happens once, when the [`HelperTable`] is built, so emission itself cannot fail on a missing
//! helper.

use std::fmt;

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{metadata::token::Token, Error, Result};

/// The runtime helpers stubs call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, EnumIter, EnumCount,
)]
#[allow(missing_docs)]
pub enum RuntimeHelper {
    /// `(nint size) -> nint`: zero-initialized native allocation
    CoTaskMemAllocAndZeroMemory,
    /// `(nint ptr)`: release a native allocation, ignoring null
    CoTaskMemFree,
    /// `(string) -> nint`: NUL-terminated UTF-16 copy
    StringToUnicodeBuffer,
    /// `(nint) -> string`
    UnicodeBufferToString,
    /// `() -> int`: offset of the first character inside a pinned string
    OffsetToStringData,
    /// `(string, bool bestFit, bool throwOnUnmappable) -> nint`
    StringToAnsiString,
    /// `(nint) -> string`
    AnsiStringToString,
    /// `(string) -> nint`
    StringToUtf8String,
    /// `(nint) -> string`
    Utf8StringToString,
    /// `(char, bool bestFit, bool throwOnUnmappable) -> byte`
    WideCharToAnsiChar,
    /// `(byte) -> char`
    AnsiCharToWideChar,
    /// `(StringBuilder, bool copyContents) -> nint`
    StringBuilderToUnicodeBuffer,
    /// `(nint, StringBuilder)`
    UnicodeBufferToStringBuilder,
    /// `(StringBuilder, bool copyContents, bool bestFit, bool throwOnUnmappable) -> nint`
    StringBuilderToAnsiString,
    /// `(nint, StringBuilder)`
    AnsiStringToStringBuilder,
    /// `(SafeHandle)`
    SafeHandleAddRef,
    /// `(SafeHandle)`
    SafeHandleRelease,
    /// `(SafeHandle) -> nint`
    SafeHandleGetHandle,
    /// `(SafeHandle, nint)`
    SafeHandleSetHandle,
    /// `(CriticalHandle) -> nint`
    CriticalHandleGetHandle,
    /// `(CriticalHandle, nint)`
    CriticalHandleSetHandle,
    /// `(Delegate) -> nint`
    GetFunctionPointerForDelegate,
    /// `(nint, RuntimeTypeHandle) -> Delegate`
    GetDelegateForFunctionPointer,
}

impl RuntimeHelper {
    /// Declaring class of the helper.
    #[must_use]
    pub fn owner(self) -> &'static str {
        match self {
            RuntimeHelper::CoTaskMemAllocAndZeroMemory
            | RuntimeHelper::CoTaskMemFree
            | RuntimeHelper::GetFunctionPointerForDelegate
            | RuntimeHelper::GetDelegateForFunctionPointer => "Marshal",
            RuntimeHelper::OffsetToStringData => "RuntimeHelpers",
            _ => "InteropHelpers",
        }
    }

    /// `Owner::Name`
    #[must_use]
    pub fn qualified_name(self) -> String {
        format!("{}::{}", self.owner(), self)
    }

    /// Number of arguments the helper pops.
    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            RuntimeHelper::OffsetToStringData => 0,
            RuntimeHelper::CoTaskMemAllocAndZeroMemory
            | RuntimeHelper::CoTaskMemFree
            | RuntimeHelper::StringToUnicodeBuffer
            | RuntimeHelper::UnicodeBufferToString
            | RuntimeHelper::AnsiStringToString
            | RuntimeHelper::StringToUtf8String
            | RuntimeHelper::Utf8StringToString
            | RuntimeHelper::AnsiCharToWideChar
            | RuntimeHelper::SafeHandleAddRef
            | RuntimeHelper::SafeHandleRelease
            | RuntimeHelper::SafeHandleGetHandle
            | RuntimeHelper::CriticalHandleGetHandle
            | RuntimeHelper::GetFunctionPointerForDelegate => 1,
            RuntimeHelper::StringBuilderToUnicodeBuffer
            | RuntimeHelper::UnicodeBufferToStringBuilder
            | RuntimeHelper::AnsiStringToStringBuilder
            | RuntimeHelper::SafeHandleSetHandle
            | RuntimeHelper::CriticalHandleSetHandle
            | RuntimeHelper::GetDelegateForFunctionPointer => 2,
            RuntimeHelper::StringToAnsiString | RuntimeHelper::WideCharToAnsiChar => 3,
            RuntimeHelper::StringBuilderToAnsiString => 4,
        }
    }

    /// Whether the helper pushes a result.
    #[must_use]
    pub fn returns_value(self) -> bool {
        !matches!(
            self,
            RuntimeHelper::CoTaskMemFree
                | RuntimeHelper::UnicodeBufferToStringBuilder
                | RuntimeHelper::AnsiStringToStringBuilder
                | RuntimeHelper::SafeHandleAddRef
                | RuntimeHelper::SafeHandleRelease
                | RuntimeHelper::SafeHandleSetHandle
                | RuntimeHelper::CriticalHandleSetHandle
        )
    }
}

/// A resolved helper: the helper identity plus the token the stub calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelperRef {
    /// Which helper
    pub helper: RuntimeHelper,
    /// `MemberRef` or `MethodDef` token of its implementation
    pub token: Token,
}

impl fmt::Display for HelperRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.helper.qualified_name(), self.token)
    }
}

/// Maps helpers to method tokens in the module receiving the stubs.
pub trait HelperResolver: Send + Sync {
    /// Token of `helper`, or `None` if the module cannot reference it.
    fn resolve(&self, helper: RuntimeHelper) -> Option<Token>;
}

/// Assigns synthetic `MemberRef` tokens (`0x0A00_0001` onward) in declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHelperResolver;

impl HelperResolver for DefaultHelperResolver {
    fn resolve(&self, helper: RuntimeHelper) -> Option<Token> {
        Some(Token::new(0x0A00_0001 + helper as u32))
    }
}

/// Every helper resolved up front.
#[derive(Debug, Clone)]
pub struct HelperTable {
    entries: Vec<HelperRef>,
}

impl HelperTable {
    /// Resolve every [`RuntimeHelper`] through `resolver`.
    ///
    /// # Errors
    /// Returns [`crate::Error::HelperNotFound`] for the first helper the resolver cannot map.
    pub fn resolve_all(resolver: &dyn HelperResolver) -> Result<Self> {
        let mut entries = Vec::with_capacity(RuntimeHelper::COUNT);
        for helper in RuntimeHelper::iter() {
            let token = resolver
                .resolve(helper)
                .ok_or(Error::HelperNotFound(helper))?;
            log::trace!("resolved helper {} -> {}", helper.qualified_name(), token);
            entries.push(HelperRef { helper, token });
        }
        Ok(HelperTable { entries })
    }

    /// The resolved reference for `helper`.
    #[must_use]
    pub fn get(&self, helper: RuntimeHelper) -> HelperRef {
        self.entries[helper as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Partial;

    impl HelperResolver for Partial {
        fn resolve(&self, helper: RuntimeHelper) -> Option<Token> {
            (helper != RuntimeHelper::CoTaskMemFree).then_some(Token::new(0x0A00_0100))
        }
    }

    #[test]
    fn default_resolver_covers_everything() {
        let table = HelperTable::resolve_all(&DefaultHelperResolver).unwrap();
        for helper in RuntimeHelper::iter() {
            let resolved = table.get(helper);
            assert_eq!(resolved.helper, helper);
            assert_eq!(resolved.token.table(), 0x0A);
        }
    }

    #[test]
    fn missing_helper_fails_resolution() {
        let result = HelperTable::resolve_all(&Partial);
        assert!(matches!(
            result,
            Err(Error::HelperNotFound(RuntimeHelper::CoTaskMemFree))
        ));
    }

    #[test]
    fn qualified_names() {
        assert_eq!(
            RuntimeHelper::CoTaskMemFree.qualified_name(),
            "Marshal::CoTaskMemFree"
        );
        assert_eq!(
            RuntimeHelper::StringToAnsiString.qualified_name(),
            "InteropHelpers::StringToAnsiString"
        );
    }
}
