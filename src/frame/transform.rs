//! Transform descriptors (DNA) and their application.
//!
//! A transform takes a source frame and produces the next frame: `fork`
//! starts a new timeline, `mut8` changes intrinsic data, `rel8` changes
//! relations. When requested, the transform also emits a DNA frame — a
//! frame recording the transform kind and parameters. Replaying a DNA
//! frame against the same source deterministically reproduces the same
//! next frame, which is what makes timeline merging possible.

use crate::error::SpaceError;
use crate::frame::{
    addr, integrity, Frame, DATA_KEY_IS_TJP, DATA_KEY_N, DATA_KEY_TIMESTAMP,
    DATA_KEY_UUID, REL8N_ANCESTOR, REL8N_DNA, REL8N_PAST, REL8N_TJP,
};
use crate::types::{Addr, Ib, ADDR_DELIMITER, GIB_SENTINEL, ROOT_ADDR};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Parameters of a single transform, as recorded in DNA.
///
/// `src_addr` is filled in when the transform is applied; the source frame
/// itself is never embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformOpts {
    Fork {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_addr: Option<Addr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest_ib: Option<Ib>,
        /// Stamp the new frame as a timeline origin (uuid + timestamp).
        #[serde(default)]
        tjp: bool,
        /// Start the sequence counter (`data.n = 0`).
        #[serde(default)]
        n_counter: bool,
        #[serde(default)]
        dna: bool,
    },
    Mut8 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_addr: Option<Addr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mut8_ib: Option<Ib>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_to_add_or_patch: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        data_to_remove: Vec<String>,
        #[serde(default)]
        dna: bool,
    },
    Rel8 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_addr: Option<Addr>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        rel8ns_to_add: BTreeMap<String, Vec<Addr>>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        rel8ns_to_remove: BTreeMap<String, Vec<Addr>>,
        #[serde(default)]
        dna: bool,
    },
}

impl TransformOpts {
    pub fn kind(&self) -> &'static str {
        match self {
            TransformOpts::Fork { .. } => "fork",
            TransformOpts::Mut8 { .. } => "mut8",
            TransformOpts::Rel8 { .. } => "rel8",
        }
    }

    fn wants_dna(&self) -> bool {
        match self {
            TransformOpts::Fork { dna, .. }
            | TransformOpts::Mut8 { dna, .. }
            | TransformOpts::Rel8 { dna, .. } => *dna,
        }
    }

    fn set_src_addr(&mut self, addr: Addr) {
        match self {
            TransformOpts::Fork { src_addr, .. }
            | TransformOpts::Mut8 { src_addr, .. }
            | TransformOpts::Rel8 { src_addr, .. } => *src_addr = Some(addr),
        }
    }
}

/// Outcome of applying a transform.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub new_frame: Frame,
    /// The DNA frame recording this transform, when requested.
    pub dna: Option<Frame>,
}

/// Build the DNA frame for a set of transform options.
///
/// DNA is itself an ordinary integrity-hashed frame: ib = transform kind,
/// data = the serialized options, ancestor = the kind's primitive.
pub fn build_dna(opts: &TransformOpts) -> Result<Frame, SpaceError> {
    let data = match serde_json::to_value(opts) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(SpaceError::Transform("transform options must serialize to an object".into())),
        Err(e) => return Err(SpaceError::Transform(e.to_string())),
    };
    let mut dna = Frame {
        ib: opts.kind().to_string(),
        gib: GIB_SENTINEL.to_string(),
        data,
        rel8ns: BTreeMap::from([(
            REL8N_ANCESTOR.to_string(),
            vec![format!("{}{ADDR_DELIMITER}{GIB_SENTINEL}", opts.kind())],
        )]),
    };
    dna.gib = integrity::compute_gib(&dna)?;
    Ok(dna)
}

/// Apply a transform to a source frame, producing the next frame (and the
/// DNA frame when requested).
pub fn apply(src: &Frame, opts: &TransformOpts) -> Result<TransformResult, SpaceError> {
    let mut opts = opts.clone();
    let src_addr = src.addr();
    opts.set_src_addr(src_addr.clone());

    let mut new_frame = match &opts {
        TransformOpts::Fork {
            dest_ib,
            tjp,
            n_counter,
            ..
        } => apply_fork(src, &src_addr, dest_ib.as_deref(), *tjp, *n_counter)?,
        TransformOpts::Mut8 {
            mut8_ib,
            data_to_add_or_patch,
            data_to_remove,
            ..
        } => apply_mut8(
            src,
            &src_addr,
            mut8_ib.as_deref(),
            data_to_add_or_patch.as_ref(),
            data_to_remove,
        )?,
        TransformOpts::Rel8 {
            rel8ns_to_add,
            rel8ns_to_remove,
            ..
        } => apply_rel8(src, &src_addr, rel8ns_to_add, rel8ns_to_remove)?,
    };

    let dna = if opts.wants_dna() {
        let dna = build_dna(&opts)?;
        new_frame
            .rel8ns
            .entry(REL8N_DNA.to_string())
            .or_default()
            .push(dna.addr());
        Some(dna)
    } else {
        None
    };

    new_frame.gib = integrity::compute_gib(&new_frame)?;
    Ok(TransformResult { new_frame, dna })
}

/// Replay a DNA frame against a source frame.
///
/// Fork DNA is rejected: a fork defines a timeline's uniqueness and occurs
/// exactly once at its origin; merges only ever replay `mut8`/`rel8`.
pub fn replay(src: &Frame, dna: &Frame) -> Result<TransformResult, SpaceError> {
    let opts: TransformOpts = serde_json::from_value(Value::Object(dna.data.clone()))
        .map_err(|e| SpaceError::Transform(format!("undecodable dna {}: {e}", dna.addr())))?;
    if matches!(opts, TransformOpts::Fork { .. }) {
        return Err(SpaceError::Transform(format!(
            "fork dna not replayable ({}); only mut8/rel8 extend an existing timeline",
            dna.addr()
        )));
    }
    apply(src, &opts)
}

fn apply_fork(
    src: &Frame,
    src_addr: &Addr,
    dest_ib: Option<&str>,
    tjp: bool,
    n_counter: bool,
) -> Result<Frame, SpaceError> {
    let ib = dest_ib.unwrap_or(&src.ib).to_string();
    let ib_errors = addr::validate_ib(&ib);
    if !ib_errors.is_empty() {
        return Err(SpaceError::Validation(ib_errors));
    }

    let mut new_frame = Frame::primitive(ib);
    // forking off the root carries no lineage
    if src_addr != ROOT_ADDR {
        new_frame
            .rel8ns
            .insert(REL8N_ANCESTOR.to_string(), vec![src_addr.clone()]);
    }
    if tjp {
        new_frame
            .data
            .insert(DATA_KEY_UUID.to_string(), json!(fresh_uuid()));
        new_frame.data.insert(
            DATA_KEY_TIMESTAMP.to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        );
        new_frame
            .data
            .insert(DATA_KEY_IS_TJP.to_string(), json!(true));
    }
    if n_counter {
        new_frame.data.insert(DATA_KEY_N.to_string(), json!(0));
    }
    Ok(new_frame)
}

fn apply_mut8(
    src: &Frame,
    src_addr: &Addr,
    mut8_ib: Option<&str>,
    patch: Option<&Map<String, Value>>,
    remove: &[String],
) -> Result<Frame, SpaceError> {
    if src.is_primitive() {
        return Err(SpaceError::Transform("cannot mut8 a primitive frame".into()));
    }
    if mut8_ib.is_none() && patch.is_none() && remove.is_empty() {
        return Err(SpaceError::Transform(
            "mut8 requires an ib change or some data to change".into(),
        ));
    }
    let mut new_frame = extend_timeline(src, src_addr);
    if let Some(ib) = mut8_ib {
        let ib_errors = addr::validate_ib(ib);
        if !ib_errors.is_empty() {
            return Err(SpaceError::Validation(ib_errors));
        }
        new_frame.ib = ib.to_string();
    }
    for key in remove {
        new_frame.data.remove(key);
    }
    if let Some(patch) = patch {
        patch_data(&mut new_frame.data, patch);
    }
    Ok(new_frame)
}

fn apply_rel8(
    src: &Frame,
    src_addr: &Addr,
    to_add: &BTreeMap<String, Vec<Addr>>,
    to_remove: &BTreeMap<String, Vec<Addr>>,
) -> Result<Frame, SpaceError> {
    if src.is_primitive() {
        return Err(SpaceError::Transform("cannot rel8 a primitive frame".into()));
    }
    if to_add.is_empty() && to_remove.is_empty() {
        return Err(SpaceError::Transform("rel8 requires relations to add or remove".into()));
    }
    let forbidden = [REL8N_PAST, REL8N_ANCESTOR, REL8N_DNA, REL8N_TJP];
    for name in to_add.keys().chain(to_remove.keys()) {
        if forbidden.contains(&name.as_str()) {
            return Err(SpaceError::Transform(format!(
                "relation `{name}` is reserved and cannot be rel8d directly"
            )));
        }
    }

    let mut new_frame = extend_timeline(src, src_addr);
    for (name, addrs) in to_add {
        let list = new_frame.rel8ns.entry(name.clone()).or_default();
        for a in addrs {
            if !list.contains(a) {
                list.push(a.clone());
            }
        }
    }
    for (name, addrs) in to_remove {
        if let Some(list) = new_frame.rel8ns.get_mut(name) {
            list.retain(|a| !addrs.contains(a));
            if list.is_empty() {
                new_frame.rel8ns.remove(name);
            }
        }
    }
    Ok(new_frame)
}

/// Clone the source into the next frame of the same timeline: past grows,
/// the tjp relation pins the origin, the sequence counter increments, and
/// the origin marker does not propagate.
fn extend_timeline(src: &Frame, src_addr: &Addr) -> Frame {
    let mut new_frame = src.clone();
    new_frame.gib = GIB_SENTINEL.to_string();
    new_frame
        .rel8ns
        .entry(REL8N_PAST.to_string())
        .or_default()
        .push(src_addr.clone());
    if src.is_tjp() {
        new_frame
            .rel8ns
            .insert(REL8N_TJP.to_string(), vec![src_addr.clone()]);
        new_frame.data.remove(DATA_KEY_IS_TJP);
        new_frame.data.remove(DATA_KEY_UUID);
        new_frame.data.remove(DATA_KEY_TIMESTAMP);
    }
    if let Some(n) = src.n() {
        new_frame.data.insert(DATA_KEY_N.to_string(), json!(n + 1));
    }
    new_frame
}

/// Additive deep patch: nested objects merge recursively, arrays and
/// scalars replace.
fn patch_data(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, patch_val) in patch {
        match (target.get_mut(key), patch_val) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                patch_data(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), patch_val.clone());
            }
        }
    }
}

fn fresh_uuid() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Convenience: fork a new timeline origin off a primitive parent.
pub fn fork_origin(parent_ib: &str, dest_ib: &str, dna: bool) -> Result<TransformResult, SpaceError> {
    let parent = Frame::primitive(parent_ib);
    apply(
        &parent,
        &TransformOpts::Fork {
            src_addr: None,
            dest_ib: Some(dest_ib.to_string()),
            tjp: true,
            n_counter: true,
            dna,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Frame {
        fork_origin("comment", "comment hello", true).unwrap().new_frame
    }

    #[test]
    fn test_fork_creates_origin() {
        let frame = origin();
        assert!(frame.is_tjp());
        assert_eq!(frame.n(), Some(0));
        assert!(frame.has_dna());
        assert!(integrity::validate_intrinsically(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_mut8_extends_timeline() {
        let o = origin();
        let mut patch = Map::new();
        patch.insert("text".to_string(), json!("hi"));
        let res = apply(
            &o,
            &TransformOpts::Mut8 {
                src_addr: None,
                mut8_ib: None,
                data_to_add_or_patch: Some(patch),
                data_to_remove: vec![],
                dna: true,
            },
        )
        .unwrap();
        let next = res.new_frame;
        assert_eq!(next.n(), Some(1));
        assert!(!next.is_tjp());
        assert_eq!(next.tjp_addr(), Some(o.addr()));
        assert_eq!(next.rel8n(REL8N_PAST), [o.addr()]);
        assert!(next.gib.contains('.'), "timeline member gib carries origin suffix");
        assert!(integrity::validate_intrinsically(&next).unwrap().is_empty());
    }

    #[test]
    fn test_replay_reproduces_frame() {
        let o = origin();
        let mut patch = Map::new();
        patch.insert("text".to_string(), json!("hi"));
        let opts = TransformOpts::Mut8 {
            src_addr: None,
            mut8_ib: None,
            data_to_add_or_patch: Some(patch),
            data_to_remove: vec![],
            dna: true,
        };
        let first = apply(&o, &opts).unwrap();
        let dna = first.dna.clone().unwrap();

        let replayed = replay(&o, &dna).unwrap();
        assert_eq!(replayed.new_frame.addr(), first.new_frame.addr());
        assert_eq!(replayed.dna.unwrap().addr(), dna.addr());
    }

    #[test]
    fn test_replay_rejects_fork() {
        let o = origin();
        let fork_dna_addr = o.rel8n(REL8N_DNA)[0].clone();
        // rebuild the fork dna from its options to replay it
        let dna = build_dna(&TransformOpts::Fork {
            src_addr: Some("comment^gib".to_string()),
            dest_ib: Some("comment hello".to_string()),
            tjp: true,
            n_counter: true,
            dna: true,
        })
        .unwrap();
        assert_eq!(addr::ib_of(&fork_dna_addr), "fork");
        assert!(replay(&o, &dna).is_err());
    }

    #[test]
    fn test_rel8_adds_and_dedupes() {
        let o = origin();
        let res = apply(
            &o,
            &TransformOpts::Rel8 {
                src_addr: None,
                rel8ns_to_add: BTreeMap::from([(
                    "pic".to_string(),
                    vec!["pic a^gib".to_string(), "pic a^gib".to_string()],
                )]),
                rel8ns_to_remove: BTreeMap::new(),
                dna: true,
            },
        )
        .unwrap();
        assert_eq!(res.new_frame.rel8n("pic"), ["pic a^gib".to_string()]);
    }

    #[test]
    fn test_rel8_rejects_reserved_names() {
        let o = origin();
        let res = apply(
            &o,
            &TransformOpts::Rel8 {
                src_addr: None,
                rel8ns_to_add: BTreeMap::from([(REL8N_PAST.to_string(), vec!["x^gib".to_string()])]),
                rel8ns_to_remove: BTreeMap::new(),
                dna: false,
            },
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_mut8_primitive_rejected() {
        let res = apply(
            &Frame::primitive("prim"),
            &TransformOpts::Mut8 {
                src_addr: None,
                mut8_ib: Some("other".to_string()),
                data_to_add_or_patch: None,
                data_to_remove: vec![],
                dna: false,
            },
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_patch_nested_objects() {
        let mut target = Map::new();
        target.insert("a".to_string(), json!({"b": 2, "keep": true}));
        let mut patch = Map::new();
        patch.insert("a".to_string(), json!({"b": 3, "c": 4}));
        patch_data(&mut target, &patch);
        assert_eq!(target["a"], json!({"b": 3, "c": 4, "keep": true}));
    }
}
