//! Purpose: Hold top-level CLI command dispatch for `fielddb`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every field name from the command line passes the boundary name check.
//! Invariants: `field set` holds the field lock across its load-modify-dump sequence.

use std::collections::HashSet;

use fielddb::api::{QueryEngine, compile_expr, parse_field_list};

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    data_dir: PathBuf,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "fielddb", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output(color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let config = serve_config_from_args(args, &data_dir)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Find { fields, query } => {
            let names = parse_field_list(&fields)?;
            let mode = parse_join_mode(&query.mode)?;
            let expr = compile_expr(&query.expr)?;
            let store = open_store(&data_dir)?;
            let keys: HashSet<String> = QueryEngine::new(&store)
                .try_find_keys::<String, Value, _, _>(&names[..], mode, |values| {
                    expr.matches_row(values)
                })?;
            emit_json(json!({ "keys": sorted_keys(keys) }), color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Group { fields, by, query } => {
            let names = parse_field_list(&fields)?;
            check_cli_name(&by)?;
            let mode = parse_join_mode(&query.mode)?;
            let expr = compile_expr(&query.expr)?;
            let store = open_store(&data_dir)?;
            let groups = QueryEngine::new(&store).try_find_keys_group_by::<String, Value, _, _>(
                &names[..],
                &by,
                mode,
                |lists| expr.matches_group(lists),
            )?;
            emit_json(json!({ "groups": groups_json(groups) }), color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Field { command } => dispatch_field_command(command, &data_dir, color_mode),
    }
}

fn dispatch_field_command(
    command: FieldCommand,
    data_dir: &Path,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        FieldCommand::Put {
            name,
            data,
            file,
            durability,
        } => {
            check_cli_name(&name)?;
            let durability = parse_durability(&durability)?;
            let field = field_from_json(read_put_input(data, file)?)?;
            let store = open_store(data_dir)?;
            store.dump_field_with(&name, &field, durability)?;
            let info = store.field_info(&name)?;
            let mut out = field_info_json(&info);
            out["entries"] = json!(field.len());
            emit_json(json!({ "field": out }), color_mode);
            Ok(RunOutcome::ok())
        }
        FieldCommand::Set {
            name,
            key,
            value,
            durability,
        } => {
            check_cli_name(&name)?;
            let durability = parse_durability(&durability)?;
            let value = Value::from(parse_inline_json(&value)?);
            let store = open_store(data_dir)?;

            let _lock = store.lock_field(&name)?;
            let mut field: Field<String, Value> = store.load_field(&name)?;
            field.insert(key.clone(), value);
            store.dump_field_with(&name, &field, durability)?;

            emit_json(
                json!({ "field": name, "key": key, "entries": field.len() }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        FieldCommand::Get { name } => {
            check_cli_name(&name)?;
            let store = open_store(data_dir)?;
            let field: Field<String, Value> = store.load_field(&name)?;
            emit_json(
                json!({ "field": name, "entries": field_entries_json(&field) }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        FieldCommand::List => {
            let store = open_store(data_dir)?;
            let fields: Vec<serde_json::Value> =
                store.list_fields()?.iter().map(field_info_json).collect();
            emit_json(json!({ "fields": fields }), color_mode);
            Ok(RunOutcome::ok())
        }
        FieldCommand::Info { name } => {
            check_cli_name(&name)?;
            let store = open_store(data_dir)?;
            let info = store
                .field_info(&name)
                .map_err(|err| add_missing_field_hint(err, &name))?;
            emit_json(json!({ "field": field_info_json(&info) }), color_mode);
            Ok(RunOutcome::ok())
        }
        FieldCommand::Delete { names } => {
            for name in &names {
                check_cli_name(name)?;
            }
            let store = open_store(data_dir)?;
            let mut deleted = Vec::with_capacity(names.len());
            for name in names {
                store
                    .delete_field(&name)
                    .map_err(|err| add_missing_field_hint(err, &name))?;
                deleted.push(name);
            }
            emit_json(json!({ "deleted": deleted }), color_mode);
            Ok(RunOutcome::ok())
        }
    }
}
