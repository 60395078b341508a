//! Transforms the caller-visible API meta into an OpenAPI v3 document.
//!
//! The document is assembled programmatically because the catalog is only
//! known at runtime; derive-style annotations cannot describe installable
//! modules.

use modular_core::catalog::{Catalog, CommandMeta, Parameter, ParamType};
use modular_core::policy::{evaluate, Statement};
use utoipa::openapi::{
    path::{OperationBuilder, ParameterBuilder, ParameterIn, PathItemBuilder, PathItemType},
    request_body::RequestBodyBuilder,
    security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    ArrayBuilder, ComponentsBuilder, ContentBuilder, InfoBuilder, ObjectBuilder, OpenApi,
    OpenApiBuilder, PathsBuilder, Required, ResponseBuilder, Schema, SchemaType,
};

pub const API_TITLE: &str = "Modular API";

fn schema_for(parameter: &Parameter) -> Schema {
    match parameter.param_type {
        ParamType::String => {
            Schema::Object(ObjectBuilder::new().schema_type(SchemaType::String).build())
        }
        ParamType::Integer => {
            Schema::Object(ObjectBuilder::new().schema_type(SchemaType::Integer).build())
        }
        ParamType::Boolean => {
            Schema::Object(ObjectBuilder::new().schema_type(SchemaType::Boolean).build())
        }
        ParamType::StringList => Schema::Array(
            ArrayBuilder::new()
                .items(Schema::Object(
                    ObjectBuilder::new().schema_type(SchemaType::String).build(),
                ))
                .build(),
        ),
    }
}

fn path_item_type(method: &str) -> PathItemType {
    match method.to_ascii_uppercase().as_str() {
        "GET" => PathItemType::Get,
        "PUT" => PathItemType::Put,
        "DELETE" => PathItemType::Delete,
        "PATCH" => PathItemType::Patch,
        "HEAD" => PathItemType::Head,
        "OPTIONS" => PathItemType::Options,
        _ => PathItemType::Post,
    }
}

fn operation_for(module: &str, command_path: &str, meta: &CommandMeta) -> utoipa::openapi::path::Operation {
    let mut operation = OperationBuilder::new()
        .operation_id(Some(format!("{module}_{}", command_path.replace('/', "_"))))
        .summary((!meta.description.is_empty()).then(|| meta.description.clone()))
        .tag(module)
        .response("200", ResponseBuilder::new().description("Backend response").build());

    let is_query = matches!(meta.route.method.to_ascii_uppercase().as_str(), "GET" | "HEAD");
    if is_query {
        for parameter in &meta.parameters {
            operation = operation.parameter(
                ParameterBuilder::new()
                    .name(&parameter.name)
                    .parameter_in(ParameterIn::Query)
                    .required(if parameter.required { Required::True } else { Required::False })
                    .description(parameter.help.clone())
                    .schema(Some(schema_for(parameter))),
            );
        }
    } else if !meta.parameters.is_empty() {
        let mut object = ObjectBuilder::new().schema_type(SchemaType::Object);
        for parameter in &meta.parameters {
            object = object.property(&parameter.name, schema_for(parameter));
            if parameter.required {
                object = object.required(&parameter.name);
            }
        }
        operation = operation.request_body(Some(
            RequestBodyBuilder::new()
                .content(
                    "application/json",
                    ContentBuilder::new().schema(Schema::Object(object.build())).build(),
                )
                .required(Some(Required::True))
                .build(),
        ));
    }
    operation.build()
}

/// Build the OpenAPI document for one caller: only the commands their
/// effective statements allow appear.
pub fn build_document(catalog: &Catalog, statements: &[Statement]) -> OpenApi {
    let mut paths = PathsBuilder::new();
    for module in catalog.modules() {
        for entry in catalog.routes() {
            if entry.module != module.name {
                continue;
            }
            if !evaluate(statements, &entry.module, &entry.command_path).is_allowed() {
                continue;
            }
            let operation = operation_for(
                &entry.module,
                &entry.command_path.to_string(),
                &entry.meta,
            );
            let item = PathItemBuilder::new()
                .operation(path_item_type(&entry.meta.route.method), operation)
                .build();
            paths = paths.path(&entry.meta.route.path, item);
        }
    }

    OpenApiBuilder::new()
        .info(
            InfoBuilder::new()
                .title(API_TITLE)
                .version(env!("CARGO_PKG_VERSION"))
                .build(),
        )
        .paths(paths.build())
        .components(Some(
            ComponentsBuilder::new()
                .security_scheme(
                    "bearer_auth",
                    SecurityScheme::Http(
                        HttpBuilder::new()
                            .scheme(HttpAuthScheme::Bearer)
                            .bearer_format("JWT")
                            .build(),
                    ),
                )
                .build(),
        ))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use modular_core::catalog::{CatalogBuilder, CommandTree};
    use modular_core::policy::Effect;
    use semver::Version;
    use serde_json::json;

    fn catalog() -> Catalog {
        let tree: CommandTree = serde_json::from_value(json!({
            "base_url": "http://127.0.0.1:9000",
            "commands": [
                {"kind": "command", "name": "aws",
                 "description": "List linked AWS accounts",
                 "parameters": [
                     {"name": "region", "type": "string", "required": true},
                     {"name": "limit", "type": "integer"}
                 ],
                 "route": {"method": "POST", "path": "/m3admin/aws"}},
                {"kind": "command", "name": "azure",
                 "route": {"method": "GET", "path": "/m3admin/azure"},
                 "parameters": [{"name": "verbose", "type": "boolean"}]}
            ]
        }))
        .unwrap();
        let mut builder = CatalogBuilder::new();
        builder.add_module("m3admin", Version::new(3, 0, 0), "/m3admin", tree).unwrap();
        builder.build()
    }

    fn allow_all() -> Vec<Statement> {
        vec![Statement {
            effect: Effect::Allow,
            module: "*".to_string(),
            resources: vec!["*".parse().unwrap()],
            description: None,
        }]
    }

    #[test]
    fn document_lists_allowed_routes() {
        let document = build_document(&catalog(), &allow_all());
        let rendered = serde_json::to_value(&document).unwrap();
        assert!(rendered["openapi"].as_str().unwrap().starts_with('3'));
        assert!(rendered["paths"]["/m3admin/aws"]["post"].is_object());
        assert!(rendered["paths"]["/m3admin/azure"]["get"].is_object());

        // POST parameters travel in the request body
        let body = &rendered["paths"]["/m3admin/aws"]["post"]["requestBody"];
        assert_eq!(
            body["content"]["application/json"]["schema"]["properties"]["region"]["type"],
            "string"
        );
        // GET parameters travel in the query
        let params = rendered["paths"]["/m3admin/azure"]["get"]["parameters"]
            .as_array()
            .unwrap();
        assert_eq!(params[0]["in"], "query");
    }

    #[test]
    fn denied_routes_are_omitted() {
        let statements = vec![Statement {
            effect: Effect::Allow,
            module: "m3admin".to_string(),
            resources: vec!["aws".parse().unwrap()],
            description: None,
        }];
        let document = build_document(&catalog(), &statements);
        let rendered = serde_json::to_value(&document).unwrap();
        assert!(rendered["paths"]["/m3admin/aws"]["post"].is_object());
        assert!(rendered["paths"].get("/m3admin/azure").is_none());
    }
}
