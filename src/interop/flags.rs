use bitflags::bitflags;

bitflags! {
    /// Per-method P/Invoke settings, as carried by `ImplMap` and `[DllImport]`.
    ///
    /// The character set bits select the default string and `char` marshalling; the best-fit and
    /// throw-on-unmappable bits control ANSI transcoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PInvokeFlags: u16 {
        /// `CharSet.Ansi`
        const CHARSET_ANSI = 0x0002;
        /// `CharSet.Unicode`
        const CHARSET_UNICODE = 0x0004;
        /// `CharSet.Auto`
        const CHARSET_AUTO = Self::CHARSET_ANSI.bits() | Self::CHARSET_UNICODE.bits();
        /// `BestFitMapping = true`
        const BEST_FIT_MAPPING = 0x0010;
        /// `ThrowOnUnmappableChar = true`
        const THROW_ON_UNMAPPABLE_CHAR = 0x1000;
        /// `SetLastError = true`
        const SET_LAST_ERROR = 0x0040;
        /// `PreserveSig = true`
        const PRESERVE_SIG = 0x0080;
    }
}

/// Effective character set for strings and chars without an explicit native type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CharSet {
    /// Single-byte system code page
    Ansi,
    /// UTF-16
    Unicode,
}

impl PInvokeFlags {
    /// The effective character set: ANSI only when the ANSI bit is set on its own.
    ///
    /// `CharSet.Auto` resolves to Unicode, as on every platform the stubs target.
    #[must_use]
    pub fn char_set(&self) -> CharSet {
        if self.contains(PInvokeFlags::CHARSET_ANSI) && !self.contains(PInvokeFlags::CHARSET_UNICODE)
        {
            CharSet::Ansi
        } else {
            CharSet::Unicode
        }
    }

    /// Whether best-fit mapping is enabled for ANSI conversions.
    #[must_use]
    pub fn best_fit_mapping(&self) -> bool {
        self.contains(PInvokeFlags::BEST_FIT_MAPPING)
    }

    /// Whether an unmappable character aborts the call.
    #[must_use]
    pub fn throw_on_unmappable_char(&self) -> bool {
        self.contains(PInvokeFlags::THROW_ON_UNMAPPABLE_CHAR)
    }
}

impl Default for PInvokeFlags {
    fn default() -> Self {
        PInvokeFlags::CHARSET_UNICODE | PInvokeFlags::PRESERVE_SIG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_set_resolution() {
        assert_eq!(PInvokeFlags::CHARSET_ANSI.char_set(), CharSet::Ansi);
        assert_eq!(PInvokeFlags::CHARSET_UNICODE.char_set(), CharSet::Unicode);
        assert_eq!(PInvokeFlags::CHARSET_AUTO.char_set(), CharSet::Unicode);
        assert_eq!(PInvokeFlags::empty().char_set(), CharSet::Unicode);
        assert_eq!(PInvokeFlags::default().char_set(), CharSet::Unicode);
    }

    #[test]
    fn transcoding_policy() {
        let flags = PInvokeFlags::CHARSET_ANSI | PInvokeFlags::THROW_ON_UNMAPPABLE_CHAR;
        assert!(flags.throw_on_unmappable_char());
        assert!(!flags.best_fit_mapping());
    }
}
