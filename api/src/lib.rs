#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the versions of the crstate CRDs.

pub mod v1alpha1;

/// GROUP is the kubernetes API group.
pub static GROUP: &str = "crstate.io";

#[cfg(test)]
mod tests {
    use kube::core::{CustomResourceExt, Resource};

    use super::*;

    #[test]
    fn dummy() {
        println!("name = {}", v1alpha1::MetricsMonitor::crd_name());
        println!("kind = {}", v1alpha1::MetricsMonitor::kind(&()));
    }
}
