//! Stock interceptors for the Raffel runtime.
//!
//! | Feature | Module | Concern |
//! | --- | --- | --- |
//! | `timeout` | [`timeout`] | per-request deadlines and abort |
//! | `metrics` | [`metrics`] | OpenTelemetry request metrics |
//! | `auth` | [`auth`] | pluggable authentication strategies |
//! | `logging` | [`logging`] | span-per-request logging |
//!
//! Rate limiting has its own crate, `raffel-rate-limiter`.
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "auth")]
#[cfg_attr(docsrs, doc(cfg(feature = "auth")))]
pub mod auth;

#[cfg(feature = "logging")]
#[cfg_attr(docsrs, doc(cfg(feature = "logging")))]
pub mod logging;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

#[cfg(feature = "timeout")]
#[cfg_attr(docsrs, doc(cfg(feature = "timeout")))]
pub mod timeout;
