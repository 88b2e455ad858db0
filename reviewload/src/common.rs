//! Helpers shared by the components that talk to the service.

use crate::transport::Endpoint;

/// Builds the label set attached to every metric a component emits.
#[derive(Debug)]
pub(crate) struct MetricsBuilder {
    labels: Vec<(String, String)>,
}

impl MetricsBuilder {
    /// Create a new builder labelled with `component`.
    pub(crate) fn new(component: &str) -> Self {
        Self {
            labels: vec![("component".to_string(), component.to_string())],
        }
    }

    /// Label with the stable name of `endpoint`.
    pub(crate) fn with_endpoint(self, endpoint: Endpoint) -> Self {
        self.with_label("endpoint", endpoint.metric_name())
    }

    /// Add a custom label.
    pub(crate) fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    /// Build the final label vector.
    pub(crate) fn build(self) -> Vec<(String, String)> {
        self.labels
    }
}

/// `labels` extended with one more pair, for one-off metric emission.
pub(crate) fn extend(labels: &[(String, String)], key: &str, value: String) -> Vec<(String, String)> {
    let mut labels = labels.to_vec();
    labels.push((key.to_string(), value));
    labels
}
