//! Network plumbing shared by the cluster services.

mod connector;

pub use connector::MdLink;
