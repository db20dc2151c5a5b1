//! Operation codes carried in the packet header.

use std::fmt;

/// Operations supported by XenStore.
///
/// Codes follow `xen/include/public/io/xs_wire.h`; `Restrict` is the only
/// one outside the contiguous `0..=19` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    Debug = 0,
    Directory = 1,
    Read = 2,
    GetPerms = 3,
    Watch = 4,
    Unwatch = 5,
    TransactionStart = 6,
    TransactionEnd = 7,
    Introduce = 8,
    Release = 9,
    GetDomainPath = 10,
    Write = 11,
    Mkdir = 12,
    Rm = 13,
    SetPerms = 14,
    WatchEvent = 15,
    Error = 16,
    IsDomainIntroduced = 17,
    Resume = 18,
    SetTarget = 19,
    Restrict = 128,
}

impl Operation {
    /// Every known operation, in wire-code order.
    pub const ALL: [Operation; 21] = [
        Self::Debug,
        Self::Directory,
        Self::Read,
        Self::GetPerms,
        Self::Watch,
        Self::Unwatch,
        Self::TransactionStart,
        Self::TransactionEnd,
        Self::Introduce,
        Self::Release,
        Self::GetDomainPath,
        Self::Write,
        Self::Mkdir,
        Self::Rm,
        Self::SetPerms,
        Self::WatchEvent,
        Self::Error,
        Self::IsDomainIntroduced,
        Self::Resume,
        Self::SetTarget,
        Self::Restrict,
    ];

    /// Wire code of this operation.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up an operation by wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.code() == code)
    }

    /// Operations whose successful reply is the literal `OK`.
    pub fn expects_ack(self) -> bool {
        matches!(
            self,
            Self::Write
                | Self::Mkdir
                | Self::Rm
                | Self::SetPerms
                | Self::Watch
                | Self::Unwatch
                | Self::TransactionEnd
                | Self::Introduce
                | Self::Release
                | Self::Resume
                | Self::SetTarget
                | Self::Restrict
        )
    }

    /// Name as used in `xs_wire.h`, without the `XS_` prefix.
    pub fn name(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Directory => "DIRECTORY",
            Self::Read => "READ",
            Self::GetPerms => "GET_PERMS",
            Self::Watch => "WATCH",
            Self::Unwatch => "UNWATCH",
            Self::TransactionStart => "TRANSACTION_START",
            Self::TransactionEnd => "TRANSACTION_END",
            Self::Introduce => "INTRODUCE",
            Self::Release => "RELEASE",
            Self::GetDomainPath => "GET_DOMAIN_PATH",
            Self::Write => "WRITE",
            Self::Mkdir => "MKDIR",
            Self::Rm => "RM",
            Self::SetPerms => "SET_PERMS",
            Self::WatchEvent => "WATCH_EVENT",
            Self::Error => "ERROR",
            Self::IsDomainIntroduced => "IS_DOMAIN_INTRODUCED",
            Self::Resume => "RESUME",
            Self::SetTarget => "SET_TARGET",
            Self::Restrict => "RESTRICT",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_xs_wire() {
        assert_eq!(Operation::Debug.code(), 0);
        assert_eq!(Operation::WatchEvent.code(), 15);
        assert_eq!(Operation::Error.code(), 16);
        assert_eq!(Operation::SetTarget.code(), 19);
        assert_eq!(Operation::Restrict.code(), 128);
    }

    #[test]
    fn test_from_code_roundtrip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_code(op.code()), Some(op));
        }
    }

    #[test]
    fn test_unknown_codes_rejected() {
        assert_eq!(Operation::from_code(20), None);
        assert_eq!(Operation::from_code(127), None);
    }

    #[test]
    fn test_ack_operations() {
        assert!(Operation::Write.expects_ack());
        assert!(Operation::TransactionEnd.expects_ack());
        assert!(!Operation::Read.expects_ack());
        assert!(!Operation::TransactionStart.expects_ack());
    }

    #[test]
    fn test_display_uses_wire_name() {
        assert_eq!(Operation::GetDomainPath.to_string(), "GET_DOMAIN_PATH");
    }
}
