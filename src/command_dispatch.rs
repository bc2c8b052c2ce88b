//! Purpose: Hold top-level CLI command dispatch for `poolprobe`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command validates the profile before touching memory.
//! Invariants: Dump files are mapped writable only for `--in-place` commands.

use super::*;
use poolprobe::api::{
    FieldValue, FunctionTable, HostContext, Memory, Overlay, PairTable, SlotLocation, SlotPool,
    SnapshotMemory, unlisten,
};
use segment_spec::load_snapshot;
use tracing::info;

pub(super) fn dispatch_command(
    command: Command,
    profile: &Profile,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "poolprobe", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Locate {
            dump,
            pool,
            handles,
        } => {
            profile.validate()?;
            let memory = load_snapshot(&dump.segments, false)?;
            let directory = PairTable::new(profile.geometry.directory);
            let slots = SlotPool::new(&memory, &directory, &profile.geometry, pool);
            let mut locations = Vec::with_capacity(handles.len());
            for handle in handles {
                let location = slots.locate(handle.into())?;
                let word = memory.read_u32(location.control_word_address)?;
                locations.push(location_json(&location, word, None, profile.geometry.free_bit)?);
            }
            emit_json(
                json!({ "pool": hex(pool), "locations": locations }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Release {
            dump,
            in_place,
            pool,
            handles,
        } => {
            profile.validate()?;
            let memory = load_snapshot(&dump.segments, in_place)?;
            let directory = PairTable::new(profile.geometry.directory);
            let slots = SlotPool::new(&memory, &directory, &profile.geometry, pool);
            // Resolve every handle before the first write.
            let mut located = Vec::with_capacity(handles.len());
            for handle in &handles {
                let location = slots.locate((*handle).into())?;
                let before = memory.read_u32(location.control_word_address)?;
                located.push((location, before));
            }
            let mut released = Vec::with_capacity(located.len());
            for (handle, (_, before)) in handles.into_iter().zip(located) {
                let location = slots.release_located(handle.into())?;
                let after = memory.read_u32(location.control_word_address)?;
                released.push(location_json(
                    &location,
                    after,
                    Some(before),
                    profile.geometry.free_bit,
                )?);
            }
            finish_write(&memory, in_place)?;
            emit_json(
                json!({ "pool": hex(pool), "in_place": in_place, "released": released }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Unlisten {
            dump,
            in_place,
            broadcaster,
            handle,
        } => {
            profile.validate()?;
            let memory = load_snapshot(&dump.segments, in_place)?;
            let directory = PairTable::new(profile.geometry.directory);
            let location = unlisten(
                &memory,
                &directory,
                &profile.geometry,
                profile.listener_pool_offset,
                broadcaster,
                handle.into(),
            )?;
            let word = memory.read_u32(location.control_word_address)?;
            finish_write(&memory, in_place)?;
            emit_json(
                json!({
                    "broadcaster": hex(broadcaster),
                    "in_place": in_place,
                    "released": location_json(&location, word, None, profile.geometry.free_bit)?,
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::View {
            dump,
            layout,
            address,
            field,
        } => {
            profile.validate()?;
            let memory = load_snapshot(&dump.segments, false)?;
            let layout = profile.layouts.get(&layout)?;
            let overlay = Overlay::new(&memory, layout, address);
            let mut fields = overlay.snapshot(&profile.layouts)?;
            if !field.is_empty() {
                fields = select_fields(fields, &field)?;
            }
            emit_json(
                json!({
                    "layout": layout.name,
                    "address": hex(address),
                    "size": hex(layout.size),
                    "fields": to_value(&fields)?,
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Dispatch {
            dump,
            table,
            object,
        } => {
            profile.validate()?;
            let memory = load_snapshot(&dump.segments, false)?;
            let bound = profile.dispatch_table(&table)?.bind(&memory, object)?;
            emit_json(to_value(&bound)?, color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Bindings { base, name } => {
            let context = HostContext::bind(base, profile.clone())?;
            let functions = context.functions();
            let value = match name {
                Some(name) => {
                    let address = functions.address_of(&name)?;
                    json!({ "name": name, "address": hex(address) })
                }
                None => bindings_json(&context, functions)?,
            };
            emit_json(value, color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Layout { command } => {
            let value = match command {
                LayoutCommand::List => {
                    let layouts = profile
                        .layouts
                        .iter()
                        .map(|layout| {
                            json!({
                                "name": layout.name,
                                "size": hex(layout.size),
                                "fields": layout.fields.len(),
                                "bits": layout.bits.len(),
                            })
                        })
                        .collect::<Vec<_>>();
                    json!({ "layouts": layouts })
                }
                LayoutCommand::Show { name } => to_value(profile.layouts.get(&name)?)?,
            };
            emit_json(value, color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Profile { command } => {
            let value = match command {
                ProfileCommand::Show => to_value(profile)?,
                ProfileCommand::Check => {
                    profile.validate()?;
                    json!({
                        "name": profile.name,
                        "valid": true,
                        "functions": profile.functions.len(),
                        "layouts": profile.layouts.len(),
                        "dispatch": profile.dispatch.len(),
                        "fingerprint": profile.fingerprint()?,
                    })
                }
                ProfileCommand::Fingerprint => json!({
                    "name": profile.name,
                    "fingerprint": profile.fingerprint()?,
                }),
            };
            emit_json(value, color_mode);
            Ok(RunOutcome::ok())
        }
    }
}

fn hex(value: u64) -> String {
    format!("{value:#x}")
}

fn to_value<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode output")
            .with_source(err)
    })
}

fn location_json(
    location: &SlotLocation,
    word: u32,
    before: Option<u32>,
    free_bit: u32,
) -> Result<Value, Error> {
    let mut value = to_value(location)?;
    if let Value::Object(map) = &mut value {
        map.insert("control_word".to_string(), json!(hex(u64::from(word))));
        map.insert("free".to_string(), json!(word & free_bit != 0));
        if let Some(before) = before {
            map.insert(
                "control_word_before".to_string(),
                json!(hex(u64::from(before))),
            );
            map.insert("was_free".to_string(), json!(before & free_bit != 0));
        }
    }
    Ok(value)
}

fn bindings_json(context: &HostContext, functions: &FunctionTable) -> Result<Value, Error> {
    Ok(json!({
        "profile": context.profile().name,
        "base": hex(context.base()),
        "functions": to_value(functions)?,
    }))
}

fn select_fields(fields: Vec<FieldValue>, wanted: &[String]) -> Result<Vec<FieldValue>, Error> {
    let mut selected = Vec::with_capacity(wanted.len());
    for name in wanted {
        let field = fields
            .iter()
            .find(|field| &field.name == name)
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("layout has no field {name}"))
                    .with_hint("List fields with `poolprobe layout show <layout>`.")
            })?;
        selected.push(field);
    }
    Ok(selected)
}

fn finish_write(memory: &SnapshotMemory, in_place: bool) -> Result<(), Error> {
    if !in_place {
        return Ok(());
    }
    memory.flush()?;
    for segment in memory.segments() {
        if let Some(path) = segment.path() {
            info!(path = %path.display(), base = segment.base(), "patched dump segment");
        }
    }
    Ok(())
}

