//! Shared type aliases and protocol constants.

/// Free-text label half of an address (e.g. `comment abc`, `bin <hash> <ext>`).
pub type Ib = String;

/// Integrity half of an address: the sentinel or an uppercase-hex hash,
/// optionally suffixed with a timeline-origin hash component.
pub type Gib = String;

/// Full frame address: `<ib><delimiter><gib>`.
pub type Addr = String;

/// Address of a timeline's originating frame. Acts as the timeline's id.
pub type TjpAddr = String;

/// Unique id of a space (a witness that stores/serves frames).
pub type SpaceId = String;

/// Id of one end-to-end synchronization attempt.
pub type SagaId = String;

/// Primary delimiter between `ib` and `gib` in an address.
pub const ADDR_DELIMITER: &str = "^";

/// Secondary delimiter inside a `gib`, separating the frame's own hash from
/// the timeline-origin hash component.
pub const GIB_TJP_DELIMITER: &str = ".";

/// Reserved "no-integrity" gib. Frames carrying it are primitives: they are
/// never hashed and carry no integrity guarantees.
pub const GIB_SENTINEL: &str = "gib";

/// The root primitive's ib.
pub const ROOT_IB: &str = "ib";

/// Address of the root primitive, `ib^gib`.
pub const ROOT_ADDR: &str = "ib^gib";
