use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "extension_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtensionKind {
    /// A single device.
    Simple,
    /// A device that additionally rings its fork ranks.
    Multiring,
    /// No device of its own, expands through fork ranks.
    Group,
    /// Placeholder for a number outside the PBX.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "forwarding_mode", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardingMode {
    Disabled,
    Enabled,
    OnBusy,
    OnUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "fork_rank_mode", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RankMode {
    /// First rank, starts ringing immediately.
    Default,
    /// Adds its members to the still-ringing set after the delay.
    Next,
    /// Replaces the previous rank's members after the delay.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "fork_rank_member_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MemberKind {
    Default,
    Auxiliary,
}

/// An addressable entity of the PBX: device, group, multiring hybrid or a
/// placeholder for an outside number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Extension {
    pub id: i32,
    pub number: String,
    pub name: Option<String>,
    pub short_name: Option<String>,
    /// Home server hosting this extension's registrations. `None` means the
    /// extension lives outside the PBX.
    pub yate_id: Option<i32>,
    pub outgoing_extension: Option<String>,
    pub outgoing_name: Option<String>,
    pub dialout_allowed: bool,
    pub ringback: bool,
    pub forwarding_delay: Option<i32>,
    pub forwarding_extension_id: Option<i32>,
    pub lang: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: ExtensionKind,
    pub forwarding_mode: ForwardingMode,
}

impl Extension {
    /// An ENABLED forward with zero or null delay takes the call away before
    /// the extension's own device or ranks ever ring.
    pub fn immediate_forward(&self) -> bool {
        self.forwarding_mode == ForwardingMode::Enabled && self.forwarding_delay.unwrap_or(0) <= 0
    }

    /// ENABLED forward with a positive delay: the device/ranks ring first,
    /// the forward target takes over after the delay.
    pub fn delayed_forward(&self) -> bool {
        self.forwarding_mode == ForwardingMode::Enabled
            && self.forwarding_delay.unwrap_or(0) > 0
            && self.forwarding_extension_id.is_some()
    }

    pub fn has_device(&self) -> bool {
        matches!(self.kind, ExtensionKind::Simple | ExtensionKind::Multiring)
    }

    /// Placeholder for a caller that is not provisioned in the store, e.g. a
    /// call arriving from an outside line.
    pub fn external_placeholder(number: &str) -> Self {
        Self {
            id: -1,
            number: number.to_string(),
            name: None,
            short_name: None,
            yate_id: None,
            outgoing_extension: None,
            outgoing_name: None,
            dialout_allowed: false,
            ringback: false,
            forwarding_delay: None,
            forwarding_extension_id: None,
            lang: None,
            kind: ExtensionKind::External,
            forwarding_mode: ForwardingMode::Disabled,
        }
    }
}

/// One ordered expansion step of a GROUP/MULTIRING extension, with its
/// members pre-joined by the store gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkRank {
    pub id: i32,
    pub extension_id: i32,
    pub index: i32,
    pub delay: Option<i32>,
    pub mode: RankMode,
    pub members: Vec<RankMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankMember {
    pub extension_id: i32,
    /// `false` means the user paused participation. The member is still
    /// discovered for diagnostics but never rings.
    pub active: bool,
    #[serde(rename = "type")]
    pub kind: MemberKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(number: &str) -> Extension {
        Extension {
            id: 1,
            number: number.to_string(),
            yate_id: Some(1),
            kind: ExtensionKind::Simple,
            ..Extension::external_placeholder(number)
        }
    }

    #[test]
    fn test_immediate_forward_needs_enabled_mode() {
        let mut ext = simple("2000");
        assert!(!ext.immediate_forward());
        ext.forwarding_mode = ForwardingMode::Enabled;
        assert!(ext.immediate_forward());
        ext.forwarding_delay = Some(10);
        assert!(!ext.immediate_forward());
        ext.forwarding_mode = ForwardingMode::OnBusy;
        assert!(!ext.immediate_forward());
    }

    #[test]
    fn test_delayed_forward_needs_target() {
        let mut ext = simple("2000");
        ext.forwarding_mode = ForwardingMode::Enabled;
        ext.forwarding_delay = Some(15);
        assert!(!ext.delayed_forward());
        ext.forwarding_extension_id = Some(7);
        assert!(ext.delayed_forward());
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(
            serde_json::to_string(&ForwardingMode::OnUnavailable).unwrap(),
            "\"ON_UNAVAILABLE\""
        );
        assert_eq!(serde_json::to_string(&ExtensionKind::Multiring).unwrap(), "\"MULTIRING\"");
        assert_eq!(serde_json::to_string(&RankMode::Drop).unwrap(), "\"DROP\"");
    }
}
