//! Deterministic textual snapshot of the handler table (the snapshot format).
//!
//! Each variant dispatches on its own `type` string field, implemented
//! with `serde`/`serde_json` rather than hand-rolled JSON construction.
//! Field names and the top-level identifier-as-decimal-string-key mapping
//! are fixed so snapshots stay portable across versions of this crate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use bpftime_sdk::{Instruction, ProgType};

use crate::error::CodecError;
use crate::slot::{
    EpollHandle, Handler, LinkHandle, MapAttr, MapStorage, MapType, PerfEventHandle,
    PerfEventType, ProgramHandle,
};
use crate::table::HandlerTable;

#[derive(Debug, Serialize, Deserialize)]
struct ProgAttr {
    #[serde(rename = "type")]
    prog_type: i32,
    insns: String,
    cnt: usize,
    attach_fds: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MapAttrJson {
    map_type: i32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: u32,
    ifindex: u32,
    btf_vmlinux_value_type_id: u32,
    btf_id: u32,
    btf_key_type_id: u32,
    btf_value_type_id: u32,
    map_extra: u64,
    kernel_bpf_map_id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PerfAttr {
    #[serde(rename = "type")]
    event_type: i32,
    offset: u64,
    pid: i32,
    ref_ctr_off: u64,
    _module_name: String,
    tracepoint_id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkAttr {
    prog_fd: usize,
    target_fd: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Record {
    #[serde(rename = "bpf_prog_handler")]
    Program { name: String, attr: ProgAttr },
    #[serde(rename = "bpf_map_handler")]
    Map { name: String, attr: MapAttrJson },
    #[serde(rename = "bpf_perf_event_handler")]
    PerfEvent { attr: PerfAttr },
    #[serde(rename = "bpf_link_handler")]
    Link { attr: LinkAttr },
    #[serde(rename = "epoll_handler")]
    Epoll {},
}

fn insns_to_hex(insns: &[Instruction]) -> String {
    let bytes = Instruction::encode_program(insns);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_to_insns(hex: &str, cnt: usize) -> Result<Vec<Instruction>, CodecError> {
    if hex.len() != cnt * Instruction::SIZE * 2 {
        return Err(CodecError::LengthMismatch {
            expected: cnt * Instruction::SIZE * 2,
            actual: hex.len(),
        });
    }
    let mut bytes = Vec::with_capacity(cnt * Instruction::SIZE);
    let digits = hex.as_bytes();
    let mut i = 0;
    while i < digits.len() {
        let hi = (digits[i] as char)
            .to_digit(16)
            .ok_or_else(|| CodecError::MalformedHex(hex.to_string()))?;
        let lo = (digits[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| CodecError::MalformedHex(hex.to_string()))?;
        bytes.push(((hi << 4) | lo) as u8);
        i += 2;
    }
    Ok(Instruction::decode_program(&bytes))
}

fn handler_to_record(handler: &Handler) -> Record {
    match handler {
        Handler::Program(p) => Record::Program {
            name: p.name.clone(),
            attr: ProgAttr {
                prog_type: p.prog_type.as_raw(),
                insns: insns_to_hex(&p.insns),
                cnt: p.insns.len(),
                attach_fds: p.attach_targets.clone(),
            },
        },
        Handler::Map(m) => Record::Map {
            name: m.name.clone(),
            attr: MapAttrJson {
                map_type: m.attr.map_type,
                key_size: m.attr.key_size,
                value_size: m.attr.value_size,
                max_entries: m.attr.max_entries,
                flags: m.attr.flags,
                ifindex: m.attr.ifindex,
                btf_vmlinux_value_type_id: m.attr.btf_vmlinux_value_type_id,
                btf_id: m.attr.btf_id,
                btf_key_type_id: m.attr.btf_key_type_id,
                btf_value_type_id: m.attr.btf_value_type_id,
                map_extra: m.attr.map_extra,
                kernel_bpf_map_id: m.attr.kernel_bpf_map_id,
            },
        },
        Handler::PerfEvent(p) => Record::PerfEvent {
            attr: PerfAttr {
                event_type: p.event_type.as_raw(),
                offset: p.offset,
                pid: p.pid,
                ref_ctr_off: p.ref_ctr_offset,
                _module_name: p.module_name.clone(),
                tracepoint_id: p.tracepoint_id,
            },
        },
        Handler::Link(l) => Record::Link {
            attr: LinkAttr { prog_fd: l.program_id, target_fd: l.target_perf_id },
        },
        Handler::Epoll(EpollHandle) => Record::Epoll {},
    }
}

fn record_to_handler(record: Record) -> Result<Handler, CodecError> {
    Ok(match record {
        Record::Program { name, attr } => {
            let prog_type = ProgType::from_raw(attr.prog_type)
                .ok_or_else(|| CodecError::Parse(format!("unknown prog_type {}", attr.prog_type)))?;
            let insns = hex_to_insns(&attr.insns, attr.cnt)?;
            Handler::Program(ProgramHandle {
                prog_type,
                name,
                insns,
                attach_targets: attr.attach_fds,
            })
        }
        Record::Map { name, attr } => {
            let map_attr = MapAttr {
                map_type: attr.map_type,
                key_size: attr.key_size,
                value_size: attr.value_size,
                max_entries: attr.max_entries,
                flags: attr.flags,
                ifindex: attr.ifindex,
                btf_vmlinux_value_type_id: attr.btf_vmlinux_value_type_id,
                btf_id: attr.btf_id,
                btf_key_type_id: attr.btf_key_type_id,
                btf_value_type_id: attr.btf_value_type_id,
                map_extra: attr.map_extra,
                kernel_bpf_map_id: attr.kernel_bpf_map_id,
            };
            let map_type = MapType::from_raw(map_attr.map_type).unwrap_or(MapType::Unspec);
            let storage = MapStorage::new(map_type, map_attr.max_entries, 1);
            Handler::Map(crate::slot::MapHandle { name, attr: map_attr, storage })
        }
        Record::PerfEvent { attr } => {
            let event_type = PerfEventType::from_raw(attr.event_type).ok_or_else(|| {
                CodecError::Parse(format!("unknown perf event type {}", attr.event_type))
            })?;
            Handler::PerfEvent(PerfEventHandle {
                event_type,
                module_name: attr._module_name,
                offset: attr.offset,
                pid: attr.pid,
                ref_ctr_offset: attr.ref_ctr_off,
                tracepoint_id: attr.tracepoint_id,
            })
        }
        Record::Link { attr } => {
            Handler::Link(LinkHandle { program_id: attr.prog_fd, target_perf_id: attr.target_fd })
        }
        Record::Epoll {} => Handler::Epoll(EpollHandle),
    })
}

/// Export the entire table to its JSON snapshot document: a mapping from
/// identifier (decimal string) to `{type, attr, name?}` (the snapshot format).
pub fn export_table(table: &HandlerTable) -> String {
    // `iterate` visits slots in ascending identifier order; `serde_json`'s
    // `preserve_order` feature keeps that order in the emitted object
    // instead of re-sorting keys lexicographically as strings.
    let mut ordered = serde_json::Map::new();
    table.iterate(|id, handler| {
        let value = serde_json::to_value(handler_to_record(handler))
            .expect("handler records always serialize");
        ordered.insert(id.to_string(), value);
    });
    let json = serde_json::to_string_pretty(&ordered).expect("handler records always serialize");
    log::debug!("exported {} handler(s) to snapshot", ordered.len());
    json
}

/// Import a JSON snapshot document, rebuilding every program/map/perf
/// event/link/epoll slot at its original identifier. `table` must be
/// empty at every identifier the document assigns (importing into a
/// non-empty table at a colliding identifier is a caller error, not a
/// codec error, and will panic — callers should `remove` or start from a
/// fresh table first).
pub fn import_table(table: &HandlerTable, json: &str) -> Result<(), CodecError> {
    let doc: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(json).map_err(|e| CodecError::Parse(e.to_string()))?;
    let mut entries: Vec<(usize, Record)> = Vec::with_capacity(doc.len());
    for (key, value) in doc {
        let id: usize = key
            .parse()
            .map_err(|_| CodecError::Parse(format!("non-numeric identifier key {key:?}")))?;
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| CodecError::Parse(format!("record {key} missing type tag")))?;
        if !matches!(
            tag,
            "bpf_prog_handler"
                | "bpf_map_handler"
                | "bpf_perf_event_handler"
                | "bpf_link_handler"
                | "epoll_handler"
        ) {
            return Err(CodecError::UnknownTag(tag.to_string()));
        }
        let record: Record =
            serde_json::from_value(value).map_err(|e| CodecError::Parse(e.to_string()))?;
        entries.push((id, record));
    }
    entries.sort_by_key(|(id, _)| *id);
    let count = entries.len();
    for (id, record) in entries {
        let handler = record_to_handler(record)?;
        table.insert_at(id, handler);
    }
    log::debug!("imported {count} handler(s) from snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpftime_sdk::{EnvConfig, Register};

    fn test_cfg(suffix: &str) -> EnvConfig {
        let mut cfg = EnvConfig::default();
        cfg.shared_memory_name = format!("bpftime_snap_test_{}_{}", std::process::id(), suffix);
        cfg
    }

    fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Instruction {
        Instruction { opcode, dst_reg: dst, src_reg: src, offset, imm }
    }

    #[test]
    fn round_trip_matches_scenario_5() {
        let table = HandlerTable::with_defaults(&test_cfg("rt")).unwrap();
        let mut prog_insns = Vec::new();
        for _ in 0..15 {
            prog_insns.push(insn(0x07, Register::R0.index() as u8, 0, 0, 1));
        }
        prog_insns.push(insn(0x95, 0, 0, 0, 0));
        assert_eq!(prog_insns.len(), 16);
        let prog = table.add_program("p", ProgType::Uprobe, prog_insns.clone()).unwrap();

        let attr = MapAttr {
            map_type: MapType::Hash.as_raw(),
            key_size: 4,
            value_size: 8,
            max_entries: 1024,
            flags: 0,
            ifindex: 0,
            btf_vmlinux_value_type_id: 0,
            btf_id: 0,
            btf_key_type_id: 0,
            btf_value_type_id: 0,
            map_extra: 0,
            kernel_bpf_map_id: 0,
        };
        table.add_map("m", attr).unwrap();

        let perf_a = table.add_uprobe(-1, "/bin/app", 0x1000, 0).unwrap();
        let perf_b = table.add_uretprobe(-1, "/bin/app", 0x1000, 0).unwrap();
        table.add_attach_target(prog, perf_a).unwrap();
        table.add_link(prog, perf_b).unwrap();

        let exported = export_table(&table);

        let table2 = HandlerTable::with_defaults(&test_cfg("rt2")).unwrap();
        import_table(&table2, &exported).unwrap();

        assert_eq!(table.size(), table2.size());
        for id in 0..table.size() {
            assert_eq!(table.is_allocated(id), table2.is_allocated(id));
        }
        let reimported_prog = table2.get(prog).unwrap();
        assert_eq!(reimported_prog.as_program().unwrap().insns, prog_insns);
        assert_eq!(reimported_prog.as_program().unwrap().attach_targets, vec![perf_a]);

        let reexported = export_table(&table2);
        assert_eq!(exported, reexported, "re-export is byte-for-byte identical");
    }

    #[test]
    fn unknown_tag_is_a_fatal_error() {
        let table = HandlerTable::with_defaults(&test_cfg("unk")).unwrap();
        let json = r#"{"0": {"type": "not_a_real_handler"}}"#;
        let err = import_table(&table, json).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(_)));
    }

    #[test]
    fn insns_hex_is_lowercase_two_chars_per_byte() {
        let insns = vec![insn(0x07, 0, 0, 0, 1)];
        let hex = insns_to_hex(&insns);
        assert_eq!(hex.len(), Instruction::SIZE * 2);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
