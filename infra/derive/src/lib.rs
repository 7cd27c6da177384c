#![allow(unreachable_pub)]
#![allow(clippy::needless_pass_by_value)]

//! # Macros
//!
//! Procedural macros shared by the storage crates of the workspace.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! regstore-derive = { path = "../infra/derive" }
//! thiserror = "2"
//! ```
//!
//! The expansion refers to `::thiserror`, so consumers must depend on it directly.

mod error;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Attribute macro for defining the error enums of a storage component.
///
/// # Features
///
/// * **Automatic Derives**: Injects `#[derive(Debug, thiserror::Error)]` unless already present.
/// * **Context Support**: Generates a companion `...Ext` trait that adds `.context()`
///   to `Result<T, Error>` and to `Result<T, Source>` for every wrapped source error.
/// * **Standard Conversions**: Implements `From<Source>` for variants with a `source` field
///   (or a field marked `#[source]`/`#[from]`), so `?` works on upstream errors.
/// * **Internal Fallback**: Implements `From<&'static str>` and `From<String>` when an
///   `Internal` variant is present.
/// * **Formatting Helper**: Emits a private `format_context` function rendering the optional
///   context as ` (context)` for use inside `#[error(...)]` strings.
///
/// # Requirements
///
/// 1. The macro must be applied to an **enum** with named-field variants only.
/// 2. A `context` field, when present, must be `Option<Cow<'static, str>>`.
/// 3. Variants with a source field must also carry a `context` field.
/// 4. At most one variant may wrap a given source type, otherwise the generated
///    `From` impls would overlap.
///
/// # Example
///
/// ```rust,ignore
/// use std::borrow::Cow;
///
/// #[regstore_derive::regstore_error]
/// pub enum BlobError {
///     #[error("I/O failure{}: {source}", format_context(.context))]
///     Io { source: std::io::Error, context: Option<Cow<'static, str>> },
///
///     #[error("Internal fault{}: {message}", format_context(.context))]
///     Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
/// }
///
/// fn load(path: &std::path::Path) -> Result<Vec<u8>, BlobError> {
///     std::fs::read(path).context("Loading blob")
/// }
/// ```
#[proc_macro_attribute]
pub fn regstore_error(_args: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    error::expand_derive(input).into()
}
