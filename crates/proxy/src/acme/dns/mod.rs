//! DNS-01 challenge support
//!
//! Publishing and verifying the TXT records that prove control of a
//! hostname to the ACME server:
//!
//! - [`DnsProvider`] - the capability contract the pipeline drives
//! - [`GandiProvider`] - production implementation (Gandi LiveDNS v5)
//! - [`PropagationChecker`] - waits for records to become visible before
//!   validation is requested

mod gandi;
mod propagation;
mod provider;

pub use gandi::GandiProvider;
pub use propagation::{PropagationChecker, PropagationConfig};
pub use provider::{
    challenge_record_fqdn, dns01_txt_value, relative_record_name, DnsProvider, DnsProviderError,
    DnsResult,
};
