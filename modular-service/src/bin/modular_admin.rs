//! # Modular Admin CLI
//!
//! Administrator-side management of the facade: policies, groups, users,
//! meta attributes, the audit trail, module install/uninstall, the offline
//! policy simulator, and the server itself.
//!
//! Every command prints a plain-text table by default and a structured
//! document with `--json`. Exit code is 0 on success, 1 on any typed error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use chrono::DateTime;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::{json, Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modular_core::pattern::CommandPath;
use modular_core::policy::{simulate, Statement};
use modular_service::bootstrap;
use modular_service::config::Config;
use modular_service::services::MetaAttribute;
use modular_service::storage::{AuditQuery, FileStore, Store};
use modular_service::AppContext;

fn cli() -> Command {
    let username = Arg::new("username").long("username").required(true);
    let policy = Arg::new("policy").long("policy").required(true);
    let group = Arg::new("group").long("group").required(true);

    Command::new("modular-admin")
        .about("Administer the modular API facade")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg(
            Arg::new("json")
                .long("json")
                .help("Emit structured JSON instead of tables")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("init").about("Seed the admin policy, group, and user"))
        .subcommand(Command::new("run").about("Start the API server"))
        .subcommand(
            Command::new("policy")
                .subcommand_required(true)
                .subcommand(
                    Command::new("add")
                        .about("Create a policy from a statement list")
                        .arg(policy.clone())
                        .arg(Arg::new("statements").long("statements")
                            .help("Statement list as inline JSON"))
                        .arg(Arg::new("statements-file").long("statements-file")
                            .value_parser(clap::value_parser!(PathBuf))
                            .help("Path to a JSON file with the statement list")),
                )
                .subcommand(
                    Command::new("update")
                        .about("Replace a policy's statements")
                        .arg(policy.clone())
                        .arg(Arg::new("statements").long("statements"))
                        .arg(Arg::new("statements-file").long("statements-file")
                            .value_parser(clap::value_parser!(PathBuf))),
                )
                .subcommand(
                    Command::new("describe")
                        .about("Show one policy or list all")
                        .arg(Arg::new("policy").long("policy")),
                )
                .subcommand(
                    Command::new("delete")
                        .about("Delete a policy after a reference check")
                        .arg(policy.clone())
                        .arg(Arg::new("force").long("force").action(ArgAction::SetTrue)
                            .help("Delete even when groups still reference the policy")),
                ),
        )
        .subcommand(
            Command::new("group")
                .subcommand_required(true)
                .subcommand(
                    Command::new("add")
                        .about("Create a group with an optional policy list")
                        .arg(group.clone())
                        .arg(Arg::new("policies").long("policies")
                            .help("Comma-separated policy names")),
                )
                .subcommand(
                    Command::new("add_policy")
                        .about("Attach a policy to a group")
                        .arg(group.clone())
                        .arg(policy.clone()),
                )
                .subcommand(
                    Command::new("delete_policy")
                        .about("Detach a policy from a group")
                        .arg(group.clone())
                        .arg(policy.clone()),
                )
                .subcommand(
                    Command::new("describe")
                        .about("Show one group or list all")
                        .arg(Arg::new("group").long("group")),
                )
                .subcommand(Command::new("delete").about("Delete a group").arg(group.clone())),
        )
        .subcommand(
            Command::new("user")
                .subcommand_required(true)
                .subcommand(
                    Command::new("add")
                        .about("Create a user; generates a password when none is given")
                        .arg(username.clone())
                        .arg(Arg::new("password").long("password"))
                        .arg(Arg::new("groups").long("groups")
                            .help("Comma-separated group names")),
                )
                .subcommand(Command::new("delete").arg(username.clone()))
                .subcommand(
                    Command::new("describe")
                        .about("Show one user or list all")
                        .arg(Arg::new("username").long("username")),
                )
                .subcommand(
                    Command::new("block")
                        .arg(username.clone())
                        .arg(Arg::new("reason").long("reason")
                            .default_value("blocked by administrator")),
                )
                .subcommand(Command::new("unblock").arg(username.clone()))
                .subcommand(
                    Command::new("change_password")
                        .arg(username.clone())
                        .arg(Arg::new("password").long("password").required(true)),
                )
                .subcommand(
                    Command::new("change_username")
                        .arg(username.clone())
                        .arg(Arg::new("new-username").long("new-username").required(true)),
                )
                .subcommand(
                    Command::new("add_to_group").arg(username.clone()).arg(group.clone()),
                )
                .subcommand(
                    Command::new("remove_from_group").arg(username.clone()).arg(group.clone()),
                )
                .subcommand(
                    Command::new("set_meta_attribute")
                        .about("Create a value allow-list or aux-data attribute")
                        .arg(username.clone())
                        .arg(Arg::new("key").long("key").required(true))
                        .arg(Arg::new("values").long("values")
                            .help("Comma-separated allowed values"))
                        .arg(Arg::new("aux").long("aux")
                            .help("Aux-data value as inline JSON")),
                )
                .subcommand(
                    Command::new("update_meta_attribute")
                        .arg(username.clone())
                        .arg(Arg::new("key").long("key").required(true))
                        .arg(Arg::new("values").long("values"))
                        .arg(Arg::new("aux").long("aux")),
                )
                .subcommand(
                    Command::new("delete_meta_attribute")
                        .arg(username.clone())
                        .arg(Arg::new("key").long("key").required(true)),
                )
                .subcommand(Command::new("reset_meta").arg(username.clone()))
                .subcommand(Command::new("get_meta").arg(username.clone())),
        )
        .subcommand(
            Command::new("audit")
                .about("Query the audit trail")
                .arg(Arg::new("from").long("from").help("RFC 3339 lower bound"))
                .arg(Arg::new("to").long("to").help("RFC 3339 upper bound"))
                .arg(Arg::new("group").long("group"))
                .arg(Arg::new("command").long("command"))
                .arg(Arg::new("invalid-only").long("invalid-only").action(ArgAction::SetTrue)
                    .help("Only records failing their integrity check")),
        )
        .subcommand(
            Command::new("policy_simulator")
                .about("Evaluate a command offline against a user, group, or policy")
                .arg(Arg::new("username").long("username"))
                .arg(Arg::new("group").long("group"))
                .arg(Arg::new("policy").long("policy"))
                .arg(Arg::new("module").long("module").required(true))
                .arg(Arg::new("command").long("command").required(true)
                    .help("Command path, e.g. tenant/describe")),
        )
        .subcommand(
            Command::new("install")
                .about("Install the module described by a descriptor file")
                .arg(Arg::new("path").long("path").required(true)
                    .value_parser(clap::value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("uninstall")
                .arg(Arg::new("module").long("module").required(true)),
        )
        .subcommand(
            Command::new("describe")
                .about("Show installed modules and their command trees")
                .arg(Arg::new("module").long("module")),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let level =
        std::env::var("MODULAR_API_CLI_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let json_output = matches.get_flag("json");
    match execute(&matches).await {
        Ok(output) => {
            if json_output {
                println!("{}", serde_json::to_string_pretty(&output).expect("serializable"));
            } else {
                print_plain(&output);
            }
        }
        Err(error) => {
            eprintln!("Error: {error:#}");
            std::process::exit(1);
        }
    }
}

async fn context() -> anyhow::Result<Arc<AppContext>> {
    let config = Config::from_env()?;
    let store: Arc<dyn Store> = Arc::new(FileStore::open(config.data_path.clone()).await?);
    Ok(AppContext::build(config, store).await?)
}

fn get<'a>(matches: &'a ArgMatches, name: &str) -> Option<&'a String> {
    matches.get_one::<String>(name)
}

fn require<'a>(matches: &'a ArgMatches, name: &str) -> &'a String {
    get(matches, name).expect("declared as required")
}

fn comma_list(matches: &ArgMatches, name: &str) -> Vec<String> {
    get(matches, name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn read_statements(matches: &ArgMatches) -> anyhow::Result<Vec<Statement>> {
    let raw = match (
        get(matches, "statements"),
        matches.get_one::<PathBuf>("statements-file"),
    ) {
        (Some(inline), None) => inline.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        _ => bail!("exactly one of --statements or --statements-file is required"),
    };
    serde_json::from_str(&raw).context("statements must be a JSON list of policy statements")
}

fn meta_attribute(matches: &ArgMatches) -> anyhow::Result<MetaAttribute> {
    match (get(matches, "values"), get(matches, "aux")) {
        (Some(values), None) => Ok(MetaAttribute::AllowedValues(
            values
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        (None, Some(aux)) => {
            Ok(MetaAttribute::AuxData(serde_json::from_str(aux).context("--aux must be JSON")?))
        }
        _ => bail!("exactly one of --values or --aux is required"),
    }
}

/// Strip stored credentials from any user-shaped document before display.
fn strip_password(mut value: Value) -> Value {
    fn strip(value: &mut Value) {
        match value {
            Value::Object(fields) => {
                fields.remove("password_hash");
                fields.values_mut().for_each(strip);
            }
            Value::Array(items) => items.iter_mut().for_each(strip),
            _ => {}
        }
    }
    strip(&mut value);
    value
}

async fn execute(matches: &ArgMatches) -> anyhow::Result<Value> {
    match matches.subcommand().expect("subcommand required") {
        ("init", _) => {
            let ctx = context().await?;
            let outcome = bootstrap::init(&ctx.policies, &ctx.groups, &ctx.users).await?;
            let mut result = json!({
                "policy_created": outcome.created_policy,
                "group_created": outcome.created_group,
                "user_created": outcome.created_user,
            });
            if let Some(password) = outcome.admin_password {
                result["admin_password"] = Value::String(password);
            }
            Ok(result)
        }
        ("run", _) => {
            let ctx = context().await?;
            let outcome = bootstrap::init(&ctx.policies, &ctx.groups, &ctx.users).await?;
            if let Some(password) = outcome.admin_password {
                println!("Autogenerated admin password: {password}");
            }
            modular_service::serve(ctx).await?;
            Ok(Value::Null)
        }
        ("policy", sub) => policy_command(sub).await,
        ("group", sub) => group_command(sub).await,
        ("user", sub) => user_command(sub).await,
        ("audit", sub) => audit_command(sub).await,
        ("policy_simulator", sub) => simulator_command(sub).await,
        ("install", sub) => {
            let ctx = context().await?;
            let path = sub.get_one::<PathBuf>("path").expect("required");
            let descriptor = ctx.registry.install(path).await?;
            Ok(json!({
                "installed": descriptor.module_name,
                "version": descriptor.version.to_string(),
                "mount_point": descriptor.mount_point,
            }))
        }
        ("uninstall", sub) => {
            let ctx = context().await?;
            let module = require(sub, "module");
            ctx.registry.uninstall(module).await?;
            Ok(json!({"uninstalled": module}))
        }
        ("describe", sub) => {
            let ctx = context().await?;
            let meta = ctx.registry.catalog().api_meta(|_, _| true);
            match get(sub, "module") {
                Some(module) => meta
                    .get(module)
                    .cloned()
                    .ok_or_else(|| anyhow!("module {module:?} is not installed")),
                None => {
                    let modules: Vec<Value> = ctx
                        .registry
                        .installed()
                        .await?
                        .into_iter()
                        .map(|descriptor| {
                            json!({
                                "module_name": descriptor.module_name,
                                "version": descriptor.version.to_string(),
                                "mount_point": descriptor.mount_point,
                                "dependencies": descriptor.dependencies.len(),
                            })
                        })
                        .collect();
                    Ok(Value::Array(modules))
                }
            }
        }
        (other, _) => bail!("unknown command {other:?}"),
    }
}

async fn policy_command(matches: &ArgMatches) -> anyhow::Result<Value> {
    let ctx = context().await?;
    match matches.subcommand().expect("subcommand required") {
        ("add", sub) => {
            let created =
                ctx.policies.create(require(sub, "policy"), read_statements(sub)?).await?;
            Ok(serde_json::to_value(created)?)
        }
        ("update", sub) => {
            let updated =
                ctx.policies.update(require(sub, "policy"), read_statements(sub)?).await?;
            Ok(serde_json::to_value(updated)?)
        }
        ("describe", sub) => match get(sub, "policy") {
            Some(name) => Ok(serde_json::to_value(ctx.policies.describe(name).await?)?),
            None => Ok(serde_json::to_value(ctx.policies.list().await?)?),
        },
        ("delete", sub) => {
            let name = require(sub, "policy");
            let referencing = ctx.policies.referencing_groups(name).await?;
            if !referencing.is_empty() && !sub.get_flag("force") {
                bail!(
                    "policy {name:?} is referenced by groups: {} (pass --force to delete anyway)",
                    referencing.join(", ")
                );
            }
            ctx.policies.delete(name).await?;
            Ok(json!({"deleted": name}))
        }
        (other, _) => bail!("unknown policy command {other:?}"),
    }
}

async fn group_command(matches: &ArgMatches) -> anyhow::Result<Value> {
    let ctx = context().await?;
    match matches.subcommand().expect("subcommand required") {
        ("add", sub) => {
            let created =
                ctx.groups.create(require(sub, "group"), comma_list(sub, "policies")).await?;
            Ok(serde_json::to_value(created)?)
        }
        ("add_policy", sub) => {
            let updated =
                ctx.groups.add_policy(require(sub, "group"), require(sub, "policy")).await?;
            Ok(serde_json::to_value(updated)?)
        }
        ("delete_policy", sub) => {
            let updated =
                ctx.groups.delete_policy(require(sub, "group"), require(sub, "policy")).await?;
            Ok(serde_json::to_value(updated)?)
        }
        ("describe", sub) => match get(sub, "group") {
            Some(name) => Ok(serde_json::to_value(ctx.groups.describe(name).await?)?),
            None => Ok(serde_json::to_value(ctx.groups.list().await?)?),
        },
        ("delete", sub) => {
            let name = require(sub, "group");
            ctx.groups.delete(name).await?;
            Ok(json!({"deleted": name}))
        }
        (other, _) => bail!("unknown group command {other:?}"),
    }
}

async fn user_command(matches: &ArgMatches) -> anyhow::Result<Value> {
    let ctx = context().await?;
    match matches.subcommand().expect("subcommand required") {
        ("add", sub) => {
            let (user, generated) = ctx
                .users
                .create(
                    require(sub, "username"),
                    get(sub, "password").map(String::as_str),
                    comma_list(sub, "groups"),
                )
                .await?;
            let mut result = strip_password(serde_json::to_value(user)?);
            if let Some(password) = generated {
                result["generated_password"] = Value::String(password);
            }
            Ok(result)
        }
        ("delete", sub) => {
            let username = require(sub, "username");
            ctx.users.delete(username).await?;
            Ok(json!({"deleted": username}))
        }
        ("describe", sub) => match get(sub, "username") {
            Some(name) => {
                Ok(strip_password(serde_json::to_value(ctx.users.describe(name).await?)?))
            }
            None => Ok(strip_password(serde_json::to_value(ctx.users.list().await?)?)),
        },
        ("block", sub) => {
            let user =
                ctx.users.block(require(sub, "username"), require(sub, "reason")).await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("unblock", sub) => {
            let user = ctx.users.unblock(require(sub, "username")).await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("change_password", sub) => {
            ctx.users
                .change_password(require(sub, "username"), require(sub, "password"))
                .await?;
            Ok(json!({"password_changed": require(sub, "username")}))
        }
        ("change_username", sub) => {
            let user = ctx
                .users
                .change_username(require(sub, "username"), require(sub, "new-username"))
                .await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("add_to_group", sub) => {
            let user =
                ctx.users.add_to_group(require(sub, "username"), require(sub, "group")).await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("remove_from_group", sub) => {
            let user = ctx
                .users
                .remove_from_group(require(sub, "username"), require(sub, "group"))
                .await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("set_meta_attribute", sub) => {
            let user = ctx
                .users
                .set_meta_attribute(require(sub, "username"), require(sub, "key"), meta_attribute(sub)?)
                .await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("update_meta_attribute", sub) => {
            let user = ctx
                .users
                .update_meta_attribute(
                    require(sub, "username"),
                    require(sub, "key"),
                    meta_attribute(sub)?,
                )
                .await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("delete_meta_attribute", sub) => {
            let user = ctx
                .users
                .delete_meta_attribute(require(sub, "username"), require(sub, "key"))
                .await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("reset_meta", sub) => {
            let user = ctx.users.reset_meta(require(sub, "username")).await?;
            Ok(strip_password(serde_json::to_value(user)?))
        }
        ("get_meta", sub) => {
            Ok(serde_json::to_value(ctx.users.get_meta(require(sub, "username")).await?)?)
        }
        (other, _) => bail!("unknown user command {other:?}"),
    }
}

async fn audit_command(matches: &ArgMatches) -> anyhow::Result<Value> {
    let ctx = context().await?;
    let parse_ts = |name: &str| -> anyhow::Result<Option<chrono::DateTime<chrono::Utc>>> {
        get(matches, name)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|ts| ts.with_timezone(&chrono::Utc))
                    .with_context(|| format!("--{name} must be an RFC 3339 timestamp"))
            })
            .transpose()
    };
    let query = AuditQuery {
        from: parse_ts("from")?,
        to: parse_ts("to")?,
        group: get(matches, "group").cloned(),
        command: get(matches, "command").cloned(),
    };
    let records = ctx.audit.query(&query, matches.get_flag("invalid-only")).await?;
    Ok(serde_json::to_value(records)?)
}

async fn simulator_command(matches: &ArgMatches) -> anyhow::Result<Value> {
    let ctx = context().await?;
    let module = require(matches, "module");
    let path = CommandPath::parse(require(matches, "command"))
        .map_err(|error| anyhow!("invalid command path: {error}"))?;

    let statements = match (
        get(matches, "username"),
        get(matches, "group"),
        get(matches, "policy"),
    ) {
        (Some(username), None, None) => {
            let user = ctx.users.describe(username).await?;
            ctx.users.effective_statements(&user.item).await?
        }
        (None, Some(group), None) => {
            let group = ctx.groups.describe(group).await?;
            let mut statements = Vec::new();
            for policy_name in &group.item.policies {
                let policy = ctx.policies.describe(policy_name).await?;
                statements.extend(policy.item.statements);
            }
            statements
        }
        (None, None, Some(policy)) => ctx.policies.describe(policy).await?.item.statements,
        _ => bail!("exactly one of --username, --group, or --policy is required"),
    };

    let outcome = simulate(&statements, module, &path);
    Ok(serde_json::to_value(outcome)?)
}

/// Plain-text rendering: arrays of objects become aligned tables, objects
/// become key/value lines.
fn print_plain(value: &Value) {
    match value {
        Value::Null => {}
        Value::Array(rows) if rows.iter().all(Value::is_object) && !rows.is_empty() => {
            let columns: Vec<String> = rows
                .iter()
                .flat_map(|row| row.as_object().expect("checked").keys().cloned())
                .fold(Vec::new(), |mut seen, key| {
                    if !seen.contains(&key) {
                        seen.push(key);
                    }
                    seen
                });
            let render = |row: &Map<String, Value>, column: &str| -> String {
                match row.get(column) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                }
            };
            let widths: Vec<usize> = columns
                .iter()
                .map(|column| {
                    rows.iter()
                        .map(|row| render(row.as_object().expect("checked"), column).len())
                        .chain([column.len()])
                        .max()
                        .unwrap_or(0)
                })
                .collect();
            let header: Vec<String> = columns
                .iter()
                .zip(&widths)
                .map(|(column, &width)| format!("{column:<width$}"))
                .collect();
            println!("{}", header.join("  "));
            for row in rows {
                let cells: Vec<String> = columns
                    .iter()
                    .zip(&widths)
                    .map(|(column, &width)| {
                        let cell = render(row.as_object().expect("checked"), column);
                        format!("{cell:<width$}")
                    })
                    .collect();
                println!("{}", cells.join("  "));
            }
        }
        Value::Array(items) => {
            for item in items {
                print_plain(item);
            }
        }
        Value::Object(fields) => {
            let width = fields.keys().map(String::len).max().unwrap_or(0);
            for (key, entry) in fields {
                let rendered = match entry {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                println!("{key:<width$}  {rendered}");
            }
        }
        other => println!("{other}"),
    }
}
