//! Certificate authority management, CONNECT interception, and the
//! rule-driven rewriting forward proxy.

pub mod ca;
pub mod duplex;
pub mod error;
pub mod httpio;
pub mod interceptor;
pub mod mime;
pub mod rewrite;

pub use ca::{CertificateAuthority, LeafCertificate};
pub use error::{CaError, InterceptError, RewriteError};
pub use interceptor::Interceptor;
pub use rewrite::{InboundRequest, OutboundResponse, RewriteProxy};
