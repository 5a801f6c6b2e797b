//! Attach errors (the error taxonomy: symbol-not-found, unsupported-target,
//! conflict, back-end-error).

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("symbol {name:?} not found{}", module.as_ref().map(|m| format!(" in module {m:?}")).unwrap_or_default())]
    SymbolNotFound { module: Option<String>, name: String },

    #[error("address {addr:#x} is not a currently-hooked probe")]
    NoSuchProbe { addr: usize },

    #[error("probe id {0} does not exist")]
    NoSuchProbeId(u64),

    #[error("address {addr:#x}: prologue too short or unsupported instruction mix to patch")]
    UnsupportedTarget { addr: usize },

    #[error("address {addr:#x} already has a replace probe installed")]
    ReplaceConflict { addr: usize },

    #[error("address {addr:#x} is replaced; cannot install an entry/return probe over it")]
    AddressIsReplaced { addr: usize },

    #[error("patching back-end error: {0}")]
    BackendError(String),
}
