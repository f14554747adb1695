//! Typed error taxonomy for the federation engine.
//!
//! Each variant corresponds to one row of the error table: propagation
//! policy is encoded at the call sites (gateway fan-out, download
//! scheduler), not here — this type only carries the classification and
//! enough context to log usefully.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EodagError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("provider {provider} is misconfigured: {message}")]
    Misconfigured { provider: String, message: String },

    #[error("authentication failed for provider {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("request to provider {provider} failed: {message}")]
    Request {
        provider: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("request to provider {provider} timed out after {elapsed_ms}ms")]
    TimeOut { provider: String, elapsed_ms: u128 },

    #[error("product {product_id} is not available yet: {reason}")]
    NotAvailable { product_id: String, reason: String },

    #[error("download of {product_id} failed: {message}")]
    Download {
        product_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("could not locate address/band {address} within downloaded product {product_id}")]
    AddressNotFound { product_id: String, address: String },

    #[error("unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },

    #[error("unsupported product type: {product_type}")]
    UnsupportedProductType { product_type: String },

    #[error("unsupported dataset address scheme: {scheme}")]
    UnsupportedDatasetAddressScheme { scheme: String },

    #[error("plugin {plugin} violated its interface contract: {message}")]
    PluginImplementation { plugin: String, message: String },
}

impl EodagError {
    /// Exit-code mapping per the external-interfaces contract: 2 =
    /// validation, 3 = unsupported provider/product type, 4 =
    /// authentication, 5 = request/download, 1 = other. The engine
    /// itself never calls `exit`; this is consumed only by CLI/server
    /// wrappers.
    pub fn exit_code(&self) -> i32 {
        match self {
            EodagError::Validation { .. } => 2,
            EodagError::UnsupportedProvider { .. }
            | EodagError::UnsupportedProductType { .. }
            | EodagError::UnsupportedDatasetAddressScheme { .. } => 3,
            EodagError::Authentication { .. } => 4,
            EodagError::Request { .. }
            | EodagError::TimeOut { .. }
            | EodagError::Download { .. }
            | EodagError::NotAvailable { .. } => 5,
            EodagError::Misconfigured { .. }
            | EodagError::AddressNotFound { .. }
            | EodagError::PluginImplementation { .. } => 1,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        EodagError::Validation { message: message.into() }
    }

    pub fn misconfigured(provider: impl Into<String>, message: impl Into<String>) -> Self {
        EodagError::Misconfigured { provider: provider.into(), message: message.into() }
    }

    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        EodagError::Authentication { provider: provider.into(), message: message.into() }
    }

    pub fn request(provider: impl Into<String>, message: impl Into<String>) -> Self {
        EodagError::Request { provider: provider.into(), message: message.into(), source: None }
    }

    pub fn timeout(provider: impl Into<String>, elapsed_ms: impl Into<u128>) -> Self {
        EodagError::TimeOut { provider: provider.into(), elapsed_ms: elapsed_ms.into() }
    }

    pub fn not_available(product_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EodagError::NotAvailable { product_id: product_id.into(), reason: reason.into() }
    }

    pub fn download(product_id: impl Into<String>, message: impl Into<String>) -> Self {
        EodagError::Download { product_id: product_id.into(), message: message.into(), source: None }
    }
}

pub type Result<T> = std::result::Result<T, EodagError>;
