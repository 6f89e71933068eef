/// Transfer syntax support for the print service
///
/// The print SCP proposes and accepts only the two uncompressed
/// little-endian transfer syntaxes. Anything else offered by a peer is left
/// unaccepted during negotiation, so pixel data always arrives in a native
/// layout the pipeline can unpack directly.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSyntaxCategory {
    /// Uncompressed transfer syntaxes
    Uncompressed,
}

#[derive(Debug, Clone)]
pub struct TransferSyntaxInfo {
    pub uid: &'static str,
    pub name: &'static str,
    pub category: TransferSyntaxCategory,
    pub is_explicit_vr: bool,
}

impl TransferSyntaxInfo {
    pub const fn new(
        uid: &'static str,
        name: &'static str,
        category: TransferSyntaxCategory,
        is_explicit_vr: bool,
    ) -> Self {
        Self {
            uid,
            name,
            category,
            is_explicit_vr,
        }
    }
}

pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

const ACCEPTED_TRANSFER_SYNTAXES: &[TransferSyntaxInfo] = &[
    TransferSyntaxInfo::new(
        IMPLICIT_VR_LE,
        "Implicit VR Little Endian",
        TransferSyntaxCategory::Uncompressed,
        false,
    ),
    TransferSyntaxInfo::new(
        EXPLICIT_VR_LE,
        "Explicit VR Little Endian",
        TransferSyntaxCategory::Uncompressed,
        true,
    ),
];

/// Registry of the transfer syntaxes this SCP accepts on any presentation
/// context.
#[derive(Debug)]
pub struct TransferSyntaxRegistry {
    syntaxes: HashMap<&'static str, TransferSyntaxInfo>,
}

impl TransferSyntaxRegistry {
    pub fn new() -> Self {
        let mut syntaxes = HashMap::new();

        for ts in ACCEPTED_TRANSFER_SYNTAXES {
            syntaxes.insert(ts.uid, ts.clone());
        }

        Self { syntaxes }
    }

    pub fn get(&self, uid: &str) -> Option<&TransferSyntaxInfo> {
        self.syntaxes.get(uid.trim_end_matches('\0'))
    }

    pub fn is_accepted(&self, uid: &str) -> bool {
        self.get(uid).is_some()
    }

    pub fn all_uids(&self) -> Vec<&'static str> {
        ACCEPTED_TRANSFER_SYNTAXES.iter().map(|ts| ts.uid).collect()
    }
}

impl Default for TransferSyntaxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_uncompressed_little_endian_is_accepted() {
        let reg = TransferSyntaxRegistry::new();
        assert!(reg.is_accepted(IMPLICIT_VR_LE));
        assert!(reg.is_accepted(EXPLICIT_VR_LE));
        // JPEG Baseline is proposed by many viewers but not accepted here
        assert!(!reg.is_accepted("1.2.840.10008.1.2.4.50"));
        assert_eq!(reg.all_uids().len(), 2);
    }
}
