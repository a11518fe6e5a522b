pub mod crd;
pub mod events;
pub mod metrics;
pub mod opensearch_controller;
pub mod pki;
pub mod render;
pub mod status;
pub mod tls;
pub mod utils;

pub const OPERATOR_NAME: &str = "opensearch.k8s.webcenter.fr";
