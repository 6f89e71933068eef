pub mod sop_classes;
pub mod transfer_syntaxes;
