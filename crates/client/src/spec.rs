//! OpenAPI spec parser.
//!
//! Fetches an OpenAPI document, reads the `x-llm` vendor extension at the
//! document root and per operation, and normalizes eligible operations into
//! [`OperationDescriptor`]s with a single merged input schema.
//!
//! Input-schema merging pulls from path parameters, query parameters, and
//! request body properties. On name collisions across these sources the
//! precedence is path > query > body; the losing source is skipped and a
//! warning is logged.

use crate::error::{ClientError, Result};
use opentools_http_guard::{FetchGuard, FetchOptions};
use openapiv3::{OpenAPI, Operation, Parameter, ParameterSchemaOrContent, ReferenceOr, Schema};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// The OpenAPI vendor extension key carrying action-discovery metadata.
pub const EXTENSION_KEY: &str = "x-llm";

/// Minimum consent level a site requires before an action executes.
///
/// Ordered by strictness so the effective level for a call is simply the max
/// of the site-declared level and the user preference.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    #[default]
    Auto,
    PerCall,
}

/// `costIndicator` extension value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CostIndicator {
    Free,
    Credits,
    Paid,
}

/// Per-operation rate limit derived from the `rateLimit` extension field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub max: u32,
    pub window: Duration,
}

/// Document-level defaults, read once per spec fetch.
#[derive(Debug, Clone)]
pub struct RootMetadata {
    pub version: String,
    pub name: String,
    pub description: Option<String>,
    pub default_approval: ApprovalPolicy,
}

/// One eligible endpoint. Immutable after parsing.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub operation_id: String,
    pub method: Method,
    pub path: String,
    /// Merged JSON Schema over path, query, header, and body parameters.
    pub input_schema: Value,
    pub approval: ApprovalPolicy,
    pub blanket_approval_allowed: bool,
    pub destructive: bool,
    pub rate_limit: Option<RateLimitSpec>,
    pub hint: Option<String>,
    pub cost_indicator: Option<CostIndicator>,
    pub description: Option<String>,
    pub(crate) parameters: Vec<ToolParameter>,
}

/// Parsed spec: document defaults plus eligible operations in declaration
/// order (stable across re-parses of an unchanged document).
#[derive(Debug, Clone)]
pub struct ParsedSpec {
    pub root: RootMetadata,
    pub operations: Vec<Arc<OperationDescriptor>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

#[derive(Debug, Clone)]
pub(crate) struct ToolParameter {
    pub(crate) name: String,
    pub(crate) location: ParamLocation,
    pub(crate) required: bool,
    pub(crate) schema: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RootExtension {
    #[serde(default)]
    version: Option<String>,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default_approval: Option<ApprovalPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct OperationExtension {
    enabled: bool,
    #[serde(default)]
    approval: Option<ApprovalPolicy>,
    #[serde(default)]
    blanket_approval_allowed: Option<bool>,
    #[serde(default)]
    destructive: Option<bool>,
    #[serde(default)]
    rate_limit: Option<RateLimitExtension>,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    cost_indicator: Option<CostIndicator>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitExtension {
    max: u32,
    window: String,
}

/// Fetch and parse an OpenAPI document into a [`ParsedSpec`].
///
/// # Errors
///
/// - [`ClientError::NoLlmExtension`] when the document has no root `x-llm`
///   block (the app does not participate; expected, non-fatal)
/// - [`ClientError::UnsupportedSpecVersion`] for non-3.x documents
/// - [`ClientError::MalformedDocument`] for parse/shape failures
/// - [`ClientError::Fetch`] for transport failures
pub async fn parse_spec(guard: &FetchGuard, spec_url: &Url) -> Result<ParsedSpec> {
    let response = guard.fetch(spec_url, FetchOptions::default()).await?;
    if !response.status.is_success() {
        return Err(ClientError::Endpoint {
            status: response.status.as_u16(),
            body: response.text().unwrap_or("").to_string(),
        });
    }
    parse_spec_document(response.text()?)
}

/// Parse an OpenAPI document from text (JSON or YAML; JSON is a valid YAML
/// subset, so one parser covers both).
///
/// # Errors
///
/// Same classification as [`parse_spec`], minus transport failures.
pub fn parse_spec_document(content: &str) -> Result<ParsedSpec> {
    let spec: OpenAPI = serde_yaml::from_str(content)
        .map_err(|e| ClientError::MalformedDocument(format!("OpenAPI document: {e}")))?;

    if !spec.openapi.starts_with("3.") {
        return Err(ClientError::UnsupportedSpecVersion(spec.openapi.clone()));
    }

    let Some(root_value) = spec.extensions.get(EXTENSION_KEY) else {
        return Err(ClientError::NoLlmExtension);
    };
    let root_ext: RootExtension = serde_json::from_value(root_value.clone())
        .map_err(|e| ClientError::MalformedDocument(format!("root {EXTENSION_KEY}: {e}")))?;

    let root = RootMetadata {
        version: root_ext.version.unwrap_or_else(|| "1".to_string()),
        name: root_ext.name,
        description: root_ext.description,
        // Absent defaultApproval means strict-by-default.
        default_approval: root_ext.default_approval.unwrap_or(ApprovalPolicy::PerCall),
    };

    let mut operations = Vec::new();

    for (path, item_ref) in &spec.paths.paths {
        let ReferenceOr::Item(item) = item_ref else {
            tracing::warn!(path = %path, "skipping referenced path item");
            continue;
        };

        let methods: [(Method, Option<&Operation>); 5] = [
            (Method::GET, item.get.as_ref()),
            (Method::POST, item.post.as_ref()),
            (Method::PUT, item.put.as_ref()),
            (Method::DELETE, item.delete.as_ref()),
            (Method::PATCH, item.patch.as_ref()),
        ];

        for (method, operation) in methods {
            let Some(op) = operation else { continue };
            let Some(ext_value) = op.extensions.get(EXTENSION_KEY) else {
                continue;
            };
            let ext: OperationExtension =
                serde_json::from_value(ext_value.clone()).map_err(|e| {
                    ClientError::MalformedDocument(format!(
                        "{EXTENSION_KEY} on {method} {path}: {e}"
                    ))
                })?;
            if !ext.enabled {
                continue;
            }

            let descriptor = build_descriptor(&spec, &root, path, method, op, &ext)?;
            operations.push(Arc::new(descriptor));
        }
    }

    Ok(ParsedSpec { root, operations })
}

fn build_descriptor(
    spec: &OpenAPI,
    root: &RootMetadata,
    path: &str,
    method: Method,
    op: &Operation,
    ext: &OperationExtension,
) -> Result<OperationDescriptor> {
    let operation_id = op
        .operation_id
        .clone()
        .unwrap_or_else(|| canonical_operation_id(&method, path));

    let rate_limit = match &ext.rate_limit {
        Some(rl) => {
            let window = parse_window(&rl.window).map_err(|e| {
                ClientError::MalformedDocument(format!("rateLimit.window on {method} {path}: {e}"))
            })?;
            Some(RateLimitSpec {
                max: rl.max,
                window,
            })
        }
        None => None,
    };

    let parameters = collect_parameters(spec, path, &method, op)?;
    let input_schema = build_input_schema(spec, &parameters);

    let description = op
        .summary
        .clone()
        .or_else(|| op.description.clone())
        .or_else(|| Some(format!("Calls {method} {path}")));

    Ok(OperationDescriptor {
        operation_id,
        method,
        path: path.to_string(),
        input_schema,
        approval: ext.approval.unwrap_or(root.default_approval),
        blanket_approval_allowed: ext.blanket_approval_allowed.unwrap_or(false),
        destructive: ext.destructive.unwrap_or(false),
        rate_limit,
        hint: ext.hint.clone(),
        cost_indicator: ext.cost_indicator,
        description,
        parameters,
    })
}

/// Merge path-item and operation parameters plus request-body properties into
/// a flat parameter list, in precedence order.
fn collect_parameters(
    spec: &OpenAPI,
    path: &str,
    method: &Method,
    op: &Operation,
) -> Result<Vec<ToolParameter>> {
    let path_item_params = match spec.paths.paths.get(path) {
        Some(ReferenceOr::Item(item)) => item.parameters.as_slice(),
        _ => &[],
    };

    // Operation-level parameters override same-name path-item parameters,
    // so they come first and win the later first-occurrence dedup.
    let mut resolved: Vec<&Parameter> = Vec::new();
    for param_ref in op.parameters.iter().chain(path_item_params.iter()) {
        match resolve_parameter(spec, param_ref) {
            Some(p) => resolved.push(p),
            None => {
                return Err(ClientError::MalformedDocument(format!(
                    "unresolvable parameter reference on {method} {path}"
                )));
            }
        }
    }

    // Precedence buckets: path > query > header > body.
    let mut ordered: Vec<ToolParameter> = Vec::new();
    for wanted in [ParamLocation::Path, ParamLocation::Query, ParamLocation::Header] {
        for param in &resolved {
            let (data, location) = match param {
                Parameter::Path { parameter_data, .. } => (parameter_data, ParamLocation::Path),
                Parameter::Query { parameter_data, .. } => (parameter_data, ParamLocation::Query),
                Parameter::Header { parameter_data, .. } => {
                    (parameter_data, ParamLocation::Header)
                }
                Parameter::Cookie { .. } => {
                    return Err(ClientError::MalformedDocument(format!(
                        "cookie parameters are not supported ({method} {path})"
                    )));
                }
            };
            if location != wanted {
                continue;
            }
            ordered.push(ToolParameter {
                name: data.name.clone(),
                location,
                // Path params are always required.
                required: location == ParamLocation::Path || data.required,
                schema: parameter_schema_json(spec, &data.format, data.description.as_deref()),
            });
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut parameters: Vec<ToolParameter> = Vec::new();
    for param in ordered {
        if !seen.insert(param.name.clone()) {
            tracing::warn!(
                parameter = %param.name,
                operation = %format!("{method} {path}"),
                "parameter name collision; keeping the higher-precedence source"
            );
            continue;
        }
        parameters.push(param);
    }

    parameters.extend(collect_body_parameters(spec, op, &mut seen, method, path));

    Ok(parameters)
}

fn collect_body_parameters(
    spec: &OpenAPI,
    op: &Operation,
    seen: &mut HashSet<String>,
    method: &Method,
    path: &str,
) -> Vec<ToolParameter> {
    let Some(body_ref) = &op.request_body else {
        return Vec::new();
    };
    let body = match body_ref {
        ReferenceOr::Item(b) => b,
        ReferenceOr::Reference { reference } => {
            let Some(b) = reference
                .strip_prefix("#/components/requestBodies/")
                .and_then(|name| spec.components.as_ref()?.request_bodies.get(name))
                .and_then(ReferenceOr::as_item)
            else {
                tracing::warn!(
                    operation = %format!("{method} {path}"),
                    "skipping unresolvable requestBody reference"
                );
                return Vec::new();
            };
            b
        }
    };

    let Some(schema_ref) = body
        .content
        .get("application/json")
        .and_then(|mt| mt.schema.as_ref())
    else {
        return Vec::new();
    };

    let schema_json = schema_ref_to_json(spec, schema_ref);

    // Flatten object properties into individual arguments; anything else
    // becomes a single `body` argument.
    let mut params = Vec::new();
    if let Some(properties) = schema_json.get("properties").and_then(Value::as_object) {
        let required_names: HashSet<&str> = schema_json
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect();

        for (prop_name, prop_schema) in properties {
            if !seen.insert(prop_name.clone()) {
                tracing::warn!(
                    parameter = %prop_name,
                    operation = %format!("{method} {path}"),
                    "body property collides with a path/query/header parameter; skipping"
                );
                continue;
            }
            params.push(ToolParameter {
                name: prop_name.clone(),
                location: ParamLocation::Body,
                required: body.required && required_names.contains(prop_name.as_str()),
                schema: prop_schema.clone(),
            });
        }
    } else if seen.insert("body".to_string()) {
        params.push(ToolParameter {
            name: "body".to_string(),
            location: ParamLocation::Body,
            required: body.required,
            schema: schema_json,
        });
    }

    params
}

fn resolve_parameter<'a>(
    spec: &'a OpenAPI,
    param_ref: &'a ReferenceOr<Parameter>,
) -> Option<&'a Parameter> {
    match param_ref {
        ReferenceOr::Item(p) => Some(p),
        ReferenceOr::Reference { reference } => reference
            .strip_prefix("#/components/parameters/")
            .and_then(|name| spec.components.as_ref()?.parameters.get(name))
            .and_then(ReferenceOr::as_item),
    }
}

fn parameter_schema_json(
    spec: &OpenAPI,
    format: &ParameterSchemaOrContent,
    description: Option<&str>,
) -> Value {
    let mut schema = match format {
        ParameterSchemaOrContent::Schema(schema_ref) => schema_ref_to_json(spec, schema_ref),
        ParameterSchemaOrContent::Content(_) => json!({"type": "string"}),
    };
    if let Some(desc) = description
        && let Some(obj) = schema.as_object_mut()
        && !obj.contains_key("description")
    {
        obj.insert("description".to_string(), Value::String(desc.to_string()));
    }
    schema
}

fn schema_ref_to_json(spec: &OpenAPI, schema_ref: &ReferenceOr<Schema>) -> Value {
    match schema_ref {
        ReferenceOr::Item(s) => schema_to_json(s),
        ReferenceOr::Reference { reference } => {
            let resolved = reference
                .strip_prefix("#/components/schemas/")
                .and_then(|name| spec.components.as_ref()?.schemas.get(name))
                .and_then(ReferenceOr::as_item);
            match resolved {
                Some(s) => schema_to_json(s),
                // Keep the $ref; build_input_schema embeds the component
                // schemas so it stays resolvable.
                None => json!({"$ref": reference}),
            }
        }
    }
}

fn schema_to_json(schema: &Schema) -> Value {
    serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}))
}

fn build_input_schema(spec: &OpenAPI, parameters: &[ToolParameter]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required: Vec<String> = Vec::new();

    for param in parameters {
        properties.insert(param.name.clone(), param.schema.clone());
        if param.required {
            required.push(param.name.clone());
        }
    }

    let mut schema = json!({
        "type": "object",
        "properties": Value::Object(properties),
    });

    if !required.is_empty() {
        schema["required"] = json!(required);
    }

    // Nested $refs point into /components/schemas; carry the component
    // schemas along so the merged schema is self-contained.
    if schema.to_string().contains("\"$ref\"")
        && let Some(components) = spec.components.as_ref()
        && let Ok(schemas) = serde_json::to_value(&components.schemas)
    {
        schema["components"] = json!({ "schemas": schemas });
    }

    schema
}

fn canonical_operation_id(method: &Method, path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_matches(['{', '}']).to_string())
        .collect();
    let mut name = method.as_str().to_ascii_lowercase();
    for seg in segments {
        name.push('_');
        name.push_str(&seg);
    }
    name
}

fn parse_window(window: &str) -> std::result::Result<Duration, String> {
    let s = window.trim();
    if s.len() < 2 || !s.is_ascii() {
        return Err(format!("invalid window '{window}'"));
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let n: u64 = num
        .parse()
        .map_err(|_| format!("invalid window '{window}'"))?;
    match unit {
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("unknown window unit in '{window}'")),
    }
}
