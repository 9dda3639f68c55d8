//! Executes one workflow node: parameter resolution, credentials,
//! retries, and the continue-on-fail contract.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::credentials::{CredentialData, CredentialProvider};
use crate::error::{Error, Result};
use crate::expression::{resolve_expressions, ExpressionContext, ExpressionScope};
use crate::nodes::{Node, NodeContext, NodeRegistry, NodeResult, MAIN_PORT};
use crate::resilience::{classify_error, ErrorRecord, Resilience, RetryOptions};
use crate::storage::NodeErrorDetail;
use crate::workflow::WorkflowNode;

/// What a node produced.
#[derive(Debug)]
pub struct NodeOutcome {
    pub result: NodeResult,
    /// Retries across all calls of this node
    pub retry_count: u32,
    /// Last failure when `continue_on_fail` absorbed one
    pub error: Option<NodeErrorDetail>,
}

/// A node failure that halts the run.
#[derive(Debug)]
pub struct NodeFailure {
    pub error: Error,
    pub detail: NodeErrorDetail,
}

struct CallOutcome {
    result: Result<NodeResult>,
    retry_count: u32,
    record: Option<ErrorRecord>,
}

/// Runs nodes on behalf of the scheduler.
#[derive(Clone)]
pub struct NodeRunner {
    registry: Arc<NodeRegistry>,
    resilience: Resilience,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl NodeRunner {
    pub fn new(registry: Arc<NodeRegistry>, resilience: Resilience) -> Self {
        Self {
            registry,
            resilience,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Execute `node` over the items in `base`.
    ///
    /// `base` carries the run metadata, the input items, and the
    /// cancellation token. Per-item nodes are called once per item and
    /// their port outputs concatenated; execute-once nodes see the whole
    /// batch in a single call.
    #[instrument(
        name = "node.execute",
        skip(self, node, base, scope, deadline),
        fields(node_id = %node.id, node_type = %node.node_type, execution_id = %base.execution_id)
    )]
    pub async fn run(
        &self,
        node: &WorkflowNode,
        mut base: NodeContext,
        scope: &ExpressionScope,
        deadline: Option<Instant>,
    ) -> std::result::Result<NodeOutcome, NodeFailure> {
        let implementation = self.registry.require(&node.node_type).map_err(failure)?;
        let metadata = implementation.metadata();

        base.node_id = node.id.clone();
        base.node_name = node.display_name().to_string();
        base.continue_on_fail = node.continue_on_fail;

        let credentials = self.load_credentials(node).await.map_err(failure)?;
        if let Some(data) = &credentials {
            base.credentials = Some(data.clone());
        }

        let error_port = metadata.outputs.first().copied().unwrap_or(MAIN_PORT);
        let items = std::mem::take(&mut base.items);

        let mut output = NodeResult::empty();
        let mut retry_count = 0;
        let mut absorbed = None;

        if node.execute_once || metadata.execute_once || items.is_empty() {
            let mut ctx = base.clone();
            ctx.items = items.clone();
            ctx.item_index = None;
            let call = self
                .call(&implementation, node, ctx, scope, &items, 0, deadline)
                .await;
            retry_count += call.retry_count;
            match call.result {
                Ok(result) => output.merge(result),
                Err(error) => {
                    let detail = error_detail(&error, call.record.as_ref(), call.retry_count, credentials.as_deref());
                    if !node.continue_on_fail {
                        return Err(NodeFailure { error, detail });
                    }
                    let annotated = if items.is_empty() {
                        vec![json!({ "error": detail.to_value() })]
                    } else {
                        items.iter().map(|item| annotate(item, &detail)).collect()
                    };
                    output.merge(NodeResult::port(error_port, annotated));
                    absorbed = Some(detail);
                }
            }
        } else {
            for (index, item) in items.iter().enumerate() {
                if let Err(error) = base.check_cancelled() {
                    let detail = error_detail(&error, None, retry_count, None);
                    return Err(NodeFailure { error, detail });
                }

                let mut ctx = base.clone();
                ctx.items = vec![item.clone()];
                ctx.item_index = Some(index);
                let call = self
                    .call(&implementation, node, ctx, scope, &items, index, deadline)
                    .await;
                retry_count += call.retry_count;
                match call.result {
                    Ok(result) => output.merge(result),
                    Err(error) => {
                        let detail = error_detail(&error, call.record.as_ref(), call.retry_count, credentials.as_deref());
                        if !node.continue_on_fail {
                            return Err(NodeFailure { error, detail });
                        }
                        warn!(item_index = index, error = %detail.message, "Item failed, continuing");
                        output.merge(NodeResult::port(error_port, vec![annotate(item, &detail)]));
                        absorbed = Some(detail);
                    }
                }
            }
        }

        debug!(items_out = output.item_count(), retry_count, "Node finished");
        Ok(NodeOutcome {
            result: output,
            retry_count,
            error: absorbed,
        })
    }

    async fn load_credentials(&self, node: &WorkflowNode) -> Result<Option<Arc<CredentialData>>> {
        let Some(id) = &node.credentials else {
            return Ok(None);
        };
        let provider = self.credentials.as_ref().ok_or_else(|| {
            Error::Credential(format!(
                "node '{}' references credential '{}' but no credential provider is configured",
                node.id, id
            ))
        })?;
        Ok(Some(Arc::new(provider.get_credential_data(id).await?)))
    }

    /// One node call with retries. Parameters are resolved again on every
    /// attempt so time- and random-based expressions produce fresh values.
    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        implementation: &Arc<dyn Node>,
        node: &WorkflowNode,
        ctx: NodeContext,
        scope: &ExpressionScope,
        input: &[Value],
        index: usize,
        deadline: Option<Instant>,
    ) -> CallOutcome {
        let resolve = || {
            resolve_expressions(&node.parameters, &ExpressionContext::new(scope, input, index))
                .map_err(Error::from)
        };

        let first = match resolve() {
            Ok(params) => params,
            Err(error) => {
                return CallOutcome {
                    result: Err(error),
                    retry_count: 0,
                    record: None,
                }
            }
        };

        let cancel = ctx.cancel.clone();
        let options = RetryOptions::new()
            .service(implementation.service_key(&first))
            .retry_enabled(node.retry_on_fail)
            .max_tries(node.max_tries)
            .cancel(&cancel)
            .deadline(deadline);

        let mut first = Some(first);
        let outcome = self
            .resilience
            .run_with_retry(options, move |attempt| {
                let params = match first.take() {
                    Some(params) => Ok(params),
                    None => resolve(),
                };
                let mut ctx = ctx.clone();
                ctx.attempt = attempt;
                let implementation = implementation.clone();
                async move {
                    let params = params?;
                    ctx.check_cancelled()?;
                    implementation.execute(&params, &ctx).await
                }
            })
            .await;

        CallOutcome {
            retry_count: outcome.retry_count(),
            result: outcome.result,
            record: outcome.last_record,
        }
    }
}

fn failure(error: Error) -> NodeFailure {
    let detail = error_detail(&error, None, 0, None);
    NodeFailure { error, detail }
}

/// Structured error detail; credential values are scrubbed from the message.
pub fn error_detail(
    error: &Error,
    record: Option<&ErrorRecord>,
    retry_count: u32,
    credentials: Option<&CredentialData>,
) -> NodeErrorDetail {
    let classification = match record {
        Some(record) => record.classification.clone(),
        None => classify_error(error),
    };
    let message = error.to_string();
    NodeErrorDetail {
        message: match credentials {
            Some(data) => data.scrub(&message),
            None => message,
        },
        category: classification.category.as_str().to_string(),
        severity: classification.severity.as_str().to_string(),
        retry_count,
    }
}

/// Attach an `error` field to a failing item.
fn annotate(item: &Value, detail: &NodeErrorDetail) -> Value {
    match item {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("error".to_string(), detail.to_value());
            Value::Object(map)
        }
        other => json!({ "value": other, "error": detail.to_value() }),
    }
}
