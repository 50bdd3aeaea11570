//! Tool generation and invocation.
//!
//! [`Connection::tools`] drives discovery and spec parsing, then derives one
//! callable [`Tool`] per eligible operation. Descriptor → tool is a pure
//! transform of immutable inputs; tools are regenerated whenever the spec is
//! re-parsed and never persisted.

use crate::approval::{ApprovalRequest, DenialReason, Verdict};
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::ratelimit::TokenBucket;
use crate::spec::{ApprovalPolicy, OperationDescriptor, ParamLocation};
use opentools_http_guard::FetchOptions;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Result of a tool invocation. Denial is a successful outcome carrying
/// data, never an error, so the calling model can react in conversation.
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Completed {
        result: Value,
        render_hint: Option<String>,
    },
    Denied {
        reason: DenialReason,
    },
}

/// Read-only view over one operation, bound to one connection.
#[derive(Clone)]
pub struct Tool {
    name: String,
    op: Arc<OperationDescriptor>,
    validator: Arc<jsonschema::Validator>,
    connection: Connection,
}

// The compiled validator and the connection handle are not Debug.
impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("operation_id", &self.op.operation_id)
            .finish_non_exhaustive()
    }
}

/// Generated tools plus per-tool descriptors, so an embedding UI can render
/// destructive warnings and approval state without re-parsing the spec.
pub struct ToolSet {
    pub tools: Vec<Tool>,
    pub metadata: HashMap<String, Arc<OperationDescriptor>>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Generate the tool set for this connection (discovery → parse → one
    /// tool per eligible operation), using the cached spec when fresh.
    ///
    /// Tool names are namespaced by the document's declared name, so a host
    /// holding tools from several connections does not collide by default.
    ///
    /// # Errors
    ///
    /// Propagates discovery, parsing, and transport failures; in particular
    /// [`ClientError::NoLlmExtension`] when the app does not participate.
    pub async fn tools(&self) -> Result<ToolSet> {
        let (_discovery, spec) = self.resolved_spec().await?;

        let namespace = sanitize_name(&spec.root.name);
        let mut names: HashSet<String> = HashSet::new();
        let mut tools = Vec::with_capacity(spec.operations.len());
        let mut metadata = HashMap::with_capacity(spec.operations.len());

        for op in &spec.operations {
            let base_name = format!("{namespace}_{}", sanitize_name(&op.operation_id));
            let name = reserve_unique_name(&mut names, &base_name);

            let validator = jsonschema::validator_for(&op.input_schema).map_err(|e| {
                ClientError::MalformedDocument(format!(
                    "input schema for '{}': {e}",
                    op.operation_id
                ))
            })?;

            metadata.insert(name.clone(), op.clone());
            tools.push(Tool {
                name,
                op: op.clone(),
                validator: Arc::new(validator),
                connection: self.clone(),
            });
        }

        Ok(ToolSet { tools, metadata })
    }
}

impl Tool {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.op.description.as_deref()
    }

    #[must_use]
    pub fn input_schema(&self) -> &Value {
        &self.op.input_schema
    }

    #[must_use]
    pub fn descriptor(&self) -> &OperationDescriptor {
        &self.op
    }

    /// Invoke the operation with the given arguments.
    ///
    /// Order: input validation, consent, rate limit, network. A rate-limited
    /// or denied call never reaches the network.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidParams`] with the violating field paths
    /// - [`ClientError::RateLimited`] when the operation's bucket is empty
    /// - [`ClientError::AuthExpired`] when the single OAuth2 refresh-retry
    ///   also fails
    /// - [`ClientError::Endpoint`] for other non-success responses
    /// - [`ClientError::Fetch`] for transport failures (cancellation while
    ///   the call is in flight surfaces as `FetchError::Cancelled`)
    pub async fn invoke(
        &self,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> Result<InvokeOutcome> {
        self.validate_params(&params)?;

        let effective = self
            .op
            .approval
            .max(self.connection.inner.config.user_approval);
        if effective == ApprovalPolicy::PerCall {
            let request = ApprovalRequest {
                operation_id: self.op.operation_id.clone(),
                tool_name: self.name.clone(),
                params: params.clone(),
                destructive: self.op.destructive,
                hint: self.op.hint.clone(),
            };
            let verdict = self
                .connection
                .inner
                .mediator
                .request_approval(
                    &self.op,
                    request,
                    self.connection.inner.consent.as_ref(),
                    cancel.as_ref(),
                )
                .await;
            if let Verdict::Denied(reason) = verdict {
                return Ok(InvokeOutcome::Denied { reason });
            }
        }

        self.check_rate_limit()?;

        let result = self.execute(&params, cancel).await?;
        Ok(InvokeOutcome::Completed {
            result,
            render_hint: self.op.hint.clone(),
        })
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        if !params.is_object() {
            return Err(ClientError::InvalidParams {
                violations: vec!["arguments must be a JSON object".to_string()],
            });
        }

        let violations: Vec<String> = self
            .validator
            .iter_errors(params)
            .map(|e| {
                let path = e.instance_path().to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ClientError::InvalidParams { violations })
        }
    }

    fn check_rate_limit(&self) -> Result<()> {
        let Some(limit) = self.op.rate_limit else {
            return Ok(());
        };
        let now = Instant::now();
        let mut limiters = self.connection.inner.limiters.lock();
        let bucket = limiters
            .entry(self.op.operation_id.clone())
            .or_insert_with(|| TokenBucket::new(limit, now));
        bucket
            .try_acquire(now)
            .map_err(|retry_after| ClientError::RateLimited { retry_after })
    }

    async fn execute(&self, params: &Value, cancel: Option<CancellationToken>) -> Result<Value> {
        let (url, headers, body) = self.build_request(params)?;

        let auth = self.connection.inner.credential.authorization_header();
        let mut request_headers = headers.clone();
        request_headers.push(auth.await?);

        let response = self
            .connection
            .inner
            .guard
            .fetch(
                &url,
                FetchOptions {
                    method: Some(self.op.method.clone()),
                    headers: request_headers,
                    body: body.clone(),
                    timeout: None,
                    cancel: cancel.clone(),
                },
            )
            .await?;

        let response = if response.status == StatusCode::UNAUTHORIZED {
            // One refresh, one retry. A second authorization failure is
            // final.
            let Some(refreshed) = self.connection.inner.credential.refreshed_header().await?
            else {
                return Err(ClientError::Endpoint {
                    status: response.status.as_u16(),
                    body: response.text().unwrap_or("").to_string(),
                });
            };
            let mut retry_headers = headers;
            retry_headers.push(refreshed);
            let retried = self
                .connection
                .inner
                .guard
                .fetch(
                    &url,
                    FetchOptions {
                        method: Some(self.op.method.clone()),
                        headers: retry_headers,
                        body,
                        timeout: None,
                        cancel,
                    },
                )
                .await?;
            if retried.status == StatusCode::UNAUTHORIZED {
                return Err(ClientError::AuthExpired);
            }
            retried
        } else {
            response
        };

        if !response.status.is_success() {
            return Err(ClientError::Endpoint {
                status: response.status.as_u16(),
                body: response.text().unwrap_or("").to_string(),
            });
        }

        let result = match response.text() {
            Ok(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
            Err(_) => Value::Null,
        };
        Ok(result)
    }

    /// Assemble URL (path substitution + query), extra headers, and JSON
    /// body from the operation's parameters.
    #[allow(clippy::type_complexity)]
    fn build_request(
        &self,
        params: &Value,
    ) -> Result<(Url, Vec<(String, String)>, Option<Value>)> {
        let mut path = self.op.path.clone();
        if !path.starts_with('/') {
            path = format!("/{path}");
        }

        let mut query: Vec<(String, String)> = Vec::new();
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut body_fields = serde_json::Map::new();
        let mut body_payload: Option<Value> = None;

        for param in &self.op.parameters {
            let value = params.get(&param.name).cloned();
            let value = match value {
                Some(Value::Null) | None => continue,
                Some(v) => v,
            };

            match param.location {
                ParamLocation::Path => {
                    path = path.replace(&format!("{{{}}}", param.name), &value_to_string(&value));
                }
                ParamLocation::Query => match &value {
                    Value::Array(items) => {
                        for item in items {
                            query.push((param.name.clone(), value_to_string(item)));
                        }
                    }
                    other => query.push((param.name.clone(), value_to_string(other))),
                },
                ParamLocation::Header => {
                    headers.push((param.name.clone(), value_to_string(&value)));
                }
                ParamLocation::Body => {
                    if param.name == "body" {
                        body_payload = Some(value);
                    } else {
                        body_fields.insert(param.name.clone(), value);
                    }
                }
            }
        }

        let base = self.connection.base_url().as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}{path}"))
            .map_err(|e| ClientError::MalformedDocument(format!("invalid endpoint URL: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let body = if let Some(payload) = body_payload {
            Some(payload)
        } else if body_fields.is_empty() {
            None
        } else {
            Some(Value::Object(body_fields))
        };

        Ok((url, headers, body))
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push_str("tool");
    }
    out
}

fn reserve_unique_name(names: &mut HashSet<String>, base: &str) -> String {
    if names.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if names.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
