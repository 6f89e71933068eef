/// DICOM SOP Class definitions for the print service
///
/// This module provides the SOP Class UIDs negotiated by the print SCP:
/// the Basic Print Management Meta SOP Classes and their members, the
/// Verification SOP Class, and a set of Storage SOP Classes accepted as a
/// C-STORE fallback for workstations that push composite instances instead
/// of driving the print dialogue.

use std::collections::HashMap;

use dicom_dictionary_std::uids;

#[derive(Debug, Clone)]
pub struct SopClassInfo {
    pub uid: &'static str,
    pub name: &'static str,
    pub category: SopClassCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SopClassCategory {
    /// C-ECHO
    Verification,
    /// Meta SOP Classes negotiated by print SCUs
    PrintMeta,
    /// Normalized print objects (Film Session, Film Box, Image Boxes)
    PrintManagement,
    /// Printer status and configuration retrieval
    Printer,
    /// Print Job (N-GET only)
    PrintJob,
    /// Composite image storage accepted as C-STORE fallback
    Storage,
}

impl SopClassInfo {
    pub const fn new(uid: &'static str, name: &'static str, category: SopClassCategory) -> Self {
        Self {
            uid,
            name,
            category,
        }
    }
}

/// Registry of every abstract syntax this SCP is willing to accept.
#[derive(Debug)]
pub struct SopClassRegistry {
    classes: HashMap<&'static str, SopClassInfo>,
}

impl SopClassRegistry {
    pub fn new() -> Self {
        let mut classes = HashMap::new();

        for sop_class in ALL_SOP_CLASSES {
            classes.insert(sop_class.uid, sop_class.clone());
        }

        Self { classes }
    }

    pub fn get(&self, uid: &str) -> Option<&SopClassInfo> {
        self.classes.get(uid.trim_end_matches('\0'))
    }

    pub fn all_uids(&self) -> Vec<&'static str> {
        ALL_SOP_CLASSES.iter().map(|sc| sc.uid).collect()
    }

    pub fn is_supported(&self, uid: &str) -> bool {
        self.get(uid).is_some()
    }

    pub fn is_storage(&self, uid: &str) -> bool {
        self.get(uid)
            .map(|sc| sc.category == SopClassCategory::Storage)
            .unwrap_or(false)
    }

    pub fn name_of(&self, uid: &str) -> Option<&'static str> {
        self.get(uid).map(|sc| sc.name)
    }
}

impl Default for SopClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const ALL_SOP_CLASSES: &[SopClassInfo] = &[
    SopClassInfo::new(
        uids::VERIFICATION,
        "Verification",
        SopClassCategory::Verification,
    ),
    // =========================================================================
    // PRINT MANAGEMENT
    // =========================================================================
    SopClassInfo::new(
        uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META,
        "Basic Grayscale Print Management Meta",
        SopClassCategory::PrintMeta,
    ),
    SopClassInfo::new(
        uids::BASIC_COLOR_PRINT_MANAGEMENT_META,
        "Basic Color Print Management Meta",
        SopClassCategory::PrintMeta,
    ),
    SopClassInfo::new(
        uids::BASIC_FILM_SESSION,
        "Basic Film Session",
        SopClassCategory::PrintManagement,
    ),
    SopClassInfo::new(
        uids::BASIC_FILM_BOX,
        "Basic Film Box",
        SopClassCategory::PrintManagement,
    ),
    SopClassInfo::new(
        uids::BASIC_GRAYSCALE_IMAGE_BOX,
        "Basic Grayscale Image Box",
        SopClassCategory::PrintManagement,
    ),
    SopClassInfo::new(
        uids::BASIC_COLOR_IMAGE_BOX,
        "Basic Color Image Box",
        SopClassCategory::PrintManagement,
    ),
    SopClassInfo::new(uids::PRINTER, "Printer", SopClassCategory::Printer),
    SopClassInfo::new(
        uids::PRINTER_CONFIGURATION_RETRIEVAL,
        "Printer Configuration Retrieval",
        SopClassCategory::Printer,
    ),
    SopClassInfo::new(uids::PRINT_JOB, "Print Job", SopClassCategory::PrintJob),
    // =========================================================================
    // STORAGE (C-STORE fallback)
    // =========================================================================
    SopClassInfo::new(
        uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
        "Computed Radiography Image Storage",
        SopClassCategory::Storage,
    ),
    SopClassInfo::new(
        uids::CT_IMAGE_STORAGE,
        "CT Image Storage",
        SopClassCategory::Storage,
    ),
    SopClassInfo::new(
        uids::MR_IMAGE_STORAGE,
        "MR Image Storage",
        SopClassCategory::Storage,
    ),
    SopClassInfo::new(
        uids::ULTRASOUND_IMAGE_STORAGE,
        "Ultrasound Image Storage",
        SopClassCategory::Storage,
    ),
    SopClassInfo::new(
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
        "Secondary Capture Image Storage",
        SopClassCategory::Storage,
    ),
    SopClassInfo::new(
        uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
        "Digital X-Ray Image Storage - For Presentation",
        SopClassCategory::Storage,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_print_classes() {
        let reg = SopClassRegistry::new();
        assert!(reg.is_supported(uids::BASIC_FILM_SESSION));
        assert!(reg.is_supported(uids::BASIC_FILM_BOX));
        assert!(reg.is_supported(uids::BASIC_GRAYSCALE_IMAGE_BOX));
        assert!(reg.is_supported(uids::BASIC_COLOR_IMAGE_BOX));
        assert!(reg.is_supported(uids::PRINTER_CONFIGURATION_RETRIEVAL));
        assert_eq!(reg.name_of(uids::PRINTER), Some("Printer"));
    }

    #[test]
    fn trailing_padding_is_tolerated() {
        let reg = SopClassRegistry::new();
        assert!(reg.is_supported("1.2.840.10008.5.1.1.1\0"));
    }

    #[test]
    fn storage_classes_are_flagged() {
        let reg = SopClassRegistry::new();
        assert!(reg.is_storage(uids::CT_IMAGE_STORAGE));
        assert!(!reg.is_storage(uids::BASIC_FILM_BOX));
    }
}
