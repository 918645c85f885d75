//! Channel identifiers and the flag words carried alongside them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reserved "no such id" value for both context and resource ids.
pub const INVALID_ID: u32 = u32::MAX;

/// Context id of the hypervisor.
pub const HYPERVISOR_CONTEXT_ID: u32 = 0;

/// Context id reserved for well-known services.
pub const WELL_KNOWN_CONTEXT_ID: u32 = 1;

/// Context id of the host.
pub const HOST_CONTEXT_ID: u32 = 2;

/// Identifies a queue pair: the creating context plus a resource id that is
/// unique within that context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelHandle {
    /// Context that owns the resource id space.
    pub context: u32,
    /// Resource id within `context`.
    pub resource: u32,
}

impl ChannelHandle {
    /// The invalid handle, used to request a freshly minted id.
    pub const INVALID: Self = Self::new(INVALID_ID, INVALID_ID);

    /// Builds a handle from its two halves.
    pub const fn new(context: u32, resource: u32) -> Self {
        Self { context, resource }
    }

    /// Returns `true` for [`ChannelHandle::INVALID`].
    pub const fn is_invalid(self) -> bool {
        self.context == INVALID_ID && self.resource == INVALID_ID
    }

    /// Packs the handle into a single 64-bit identifier (context in the
    /// high half).
    pub const fn to_u64(self) -> u64 {
        ((self.context as u64) << 32) | self.resource as u64
    }

    /// Inverse of [`ChannelHandle::to_u64`].
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_u64(raw: u64) -> Self {
        Self::new((raw >> 32) as u32, raw as u32)
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context, self.resource)
    }
}

impl FromStr for ChannelHandle {
    type Err = String;

    /// Parses the `context:resource` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ctx, res) = s
            .split_once(':')
            .ok_or_else(|| format!("expected CONTEXT:RESOURCE, got '{s}'"))?;
        let context = ctx
            .trim()
            .parse()
            .map_err(|e| format!("bad context id '{ctx}': {e}"))?;
        let resource = res
            .trim()
            .parse()
            .map_err(|e| format!("bad resource id '{res}': {e}"))?;
        Ok(Self::new(context, resource))
    }
}

bitflags::bitflags! {
    /// Queue pair creation flags, as sent on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct QpFlags: u32 {
        /// Only attach to an existing queue pair; never create one.
        const ATTACH_ONLY = 0x1;
        /// Both endpoints live in the same context; no peer negotiation.
        const LOCAL = 0x2;
        /// Ring operations must not block.
        const NONBLOCK = 0x4;
    }
}

bitflags::bitflags! {
    /// Privileges a caller may request for a queue pair.
    ///
    /// Guests may only ask for [`Privilege::NONE`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Privilege: u32 {
        /// Restricted endpoint (host only).
        const RESTRICTED = 0x1;
        /// Trusted endpoint (host only).
        const TRUSTED = 0x2;
    }
}

impl Privilege {
    /// No privilege requested.
    pub const NONE: Self = Self::empty();
}
