//! Status bookkeeping for [`Opensearch`] clusters.
//!
//! Each TLS reconciler owns one condition. Its reason moves from `Initialize` to
//! `Success` or `Failed`; the `lastTransitionTime` only changes when the status flips.

use stackable_operator::{
    k8s_openapi::{
        apimachinery::pkg::apis::meta::v1::{Condition, Time},
        chrono::Utc,
    },
    kube::ResourceExt,
};

use crate::{
    crd::Opensearch,
    render::{naming, HTTP_PORT},
};

pub const TRANSPORT_TLS_CONDITION: &str = "OpensearchTransportTls";
pub const API_TLS_CONDITION: &str = "OpensearchApiTls";

pub const RUNNING_PHASE: &str = "Running";

pub mod reasons {
    pub const INITIALIZE: &str = "Initialize";
    pub const SUCCESS: &str = "Success";
    pub const FAILED: &str = "Failed";
}

fn status_string(status: bool) -> String {
    if status { "True" } else { "False" }.to_string()
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|condition| condition.status == "True")
}

/// Adds the condition, or replaces the one of the same type.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) {
    let status = status_string(status);
    let mut condition = Condition {
        type_: type_.to_string(),
        last_transition_time: Time(Utc::now()),
        status,
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
    };
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Adds the `Initialize` condition when the reconciler has never reported for this cluster.
///
/// Returns `true` on first sight.
pub fn initialize_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    observed_generation: Option<i64>,
) -> bool {
    if find_condition(conditions, type_).is_some() {
        return false;
    }
    set_condition(
        conditions,
        type_,
        false,
        reasons::INITIALIZE,
        "Starting to reconcile",
        observed_generation,
    );
    true
}

/// The address clients should use to reach the cluster API.
pub fn cluster_url(cluster: &Opensearch) -> String {
    if let Some(host) = cluster
        .ingress()
        .and_then(|ingress| ingress.host.as_deref())
        .filter(|host| !host.is_empty())
    {
        return format!("https://{host}");
    }
    let namespace = cluster.namespace().unwrap_or_default();
    let service = if cluster.is_load_balancer_enabled() {
        naming::load_balancer_service_name(cluster)
    } else {
        naming::global_service_name(cluster)
    };
    format!("https://{service}.{namespace}.svc:{HTTP_PORT}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::test_support::cluster_from_yaml;

    #[test]
    fn conditions_are_replaced_by_type() {
        let mut conditions = Vec::new();
        assert!(initialize_condition(&mut conditions, TRANSPORT_TLS_CONDITION, Some(1)));
        assert!(!initialize_condition(&mut conditions, TRANSPORT_TLS_CONDITION, Some(1)));
        assert!(initialize_condition(&mut conditions, API_TLS_CONDITION, Some(1)));
        assert_eq!(conditions.len(), 2);
        assert!(!is_condition_true(&conditions, TRANSPORT_TLS_CONDITION));

        set_condition(
            &mut conditions,
            TRANSPORT_TLS_CONDITION,
            true,
            reasons::SUCCESS,
            "Secret opensearch-test-transport-tls up to date",
            Some(2),
        );
        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, TRANSPORT_TLS_CONDITION));
        assert!(!is_condition_true(&conditions, API_TLS_CONDITION));
        let transport = find_condition(&conditions, TRANSPORT_TLS_CONDITION).unwrap();
        assert_eq!(transport.reason, "Success");
        assert_eq!(transport.observed_generation, Some(2));
    }

    #[test]
    fn transition_time_is_kept_while_status_is_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, API_TLS_CONDITION, false, reasons::FAILED, "boom", None);
        let first = conditions[0].last_transition_time.clone();
        std::thread::sleep(std::time::Duration::from_millis(5));
        set_condition(&mut conditions, API_TLS_CONDITION, false, reasons::FAILED, "again", None);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "again");
        set_condition(&mut conditions, API_TLS_CONDITION, true, reasons::SUCCESS, "ok", None);
        assert_ne!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn url_prefers_ingress_then_load_balancer() {
        let ingress = cluster_from_yaml(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              endpoint:
                ingress:
                  enabled: true
                  host: search.example.com
                loadBalancer:
                  enabled: true
            "#,
        );
        assert_eq!(cluster_url(&ingress), "https://search.example.com");

        let load_balancer = cluster_from_yaml(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              endpoint:
                loadBalancer:
                  enabled: true
            "#,
        );
        assert_eq!(
            cluster_url(&load_balancer),
            "https://test-os-lb.default.svc:9200"
        );

        let plain = cluster_from_yaml(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec: {}
            "#,
        );
        assert_eq!(cluster_url(&plain), "https://test-os.default.svc:9200");
    }
}
