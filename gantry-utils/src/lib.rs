#![deny(unused_extern_crates)]
#![deny(unsafe_code)]

pub mod retry;
mod shell;

pub use retry::{RetryConfig, retry_if, retry_with_backoff};
pub use shell::{ps_quote, sh_quote};
