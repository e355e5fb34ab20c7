//! Command dialects
//!
//! Each device family declares how a freshly opened session has to be
//! prepared and how raw output is cleaned up. The connection manager only
//! talks to this trait and never inspects device type strings.

use std::fmt::Debug;
use std::sync::Arc;

/// Capability set of a remote shell command dialect
pub trait Dialect: Send + Sync + Debug {
    /// Device family tag as written in configuration
    fn name(&self) -> &str;

    /// Commands sent once after a session is opened (paging off and similar)
    fn session_setup(&self) -> &[&'static str] {
        &[]
    }

    /// Command text actually sent for a configured command
    fn render_command(&self, command: &str) -> String {
        command.to_string()
    }

    /// Normalize raw output before it reaches the output pipeline
    fn clean_output(&self, raw: &str) -> String {
        let mut cleaned = raw.replace("\r\n", "\n");
        let trimmed_len = cleaned.trim_end().len();
        cleaned.truncate(trimmed_len);
        cleaned
    }
}

/// Cisco IOS, IOS-XE, NX-OS and IOS-XR
#[derive(Debug, Clone)]
pub struct CiscoIos {
    tag: String,
}

impl Dialect for CiscoIos {
    fn name(&self) -> &str {
        &self.tag
    }

    fn session_setup(&self) -> &[&'static str] {
        &["terminal length 0", "terminal width 511"]
    }
}

/// Cisco ASA firewalls
#[derive(Debug, Clone)]
pub struct CiscoAsa;

impl Dialect for CiscoAsa {
    fn name(&self) -> &str {
        "cisco_asa"
    }

    fn session_setup(&self) -> &[&'static str] {
        &["terminal pager 0"]
    }
}

/// Arista EOS
#[derive(Debug, Clone)]
pub struct AristaEos;

impl Dialect for AristaEos {
    fn name(&self) -> &str {
        "arista_eos"
    }

    fn session_setup(&self) -> &[&'static str] {
        &["terminal length 0", "terminal width 32767"]
    }
}

/// Juniper Junos
#[derive(Debug, Clone)]
pub struct Juniper {
    tag: String,
}

impl Dialect for Juniper {
    fn name(&self) -> &str {
        &self.tag
    }

    fn session_setup(&self) -> &[&'static str] {
        &["set cli screen-length 0", "set cli screen-width 511"]
    }

    fn render_command(&self, command: &str) -> String {
        // Pipe through `no-more` so a pager never stalls the channel
        if command.contains("| no-more") {
            command.to_string()
        } else {
            format!("{} | no-more", command)
        }
    }
}

/// HP ProCurve / Aruba-OS switches
#[derive(Debug, Clone)]
pub struct HpProcurve;

impl Dialect for HpProcurve {
    fn name(&self) -> &str {
        "hp_procurve"
    }

    fn session_setup(&self) -> &[&'static str] {
        &["no page"]
    }
}

/// HP Comware
#[derive(Debug, Clone)]
pub struct HpComware;

impl Dialect for HpComware {
    fn name(&self) -> &str {
        "hp_comware"
    }

    fn session_setup(&self) -> &[&'static str] {
        &["screen-length disable"]
    }
}

/// Plain Linux hosts
#[derive(Debug, Clone)]
pub struct Linux;

impl Dialect for Linux {
    fn name(&self) -> &str {
        "linux"
    }
}

/// Fallback for unknown device families: no setup, output passed through
#[derive(Debug, Clone)]
pub struct Generic {
    tag: String,
}

impl Dialect for Generic {
    fn name(&self) -> &str {
        &self.tag
    }
}

/// Device type tags with a dedicated dialect
pub const KNOWN_DEVICE_TYPES: &[&str] = &[
    "cisco_ios",
    "cisco_xe",
    "cisco_nxos",
    "cisco_xr",
    "cisco_asa",
    "arista_eos",
    "juniper",
    "juniper_junos",
    "hp_procurve",
    "hp_comware",
    "linux",
];

/// Resolve a device type tag to its dialect
///
/// Unknown tags get the generic dialect so custom device families still work.
pub fn dialect_for(device_type: &str) -> Arc<dyn Dialect> {
    match device_type {
        "cisco_ios" | "cisco_xe" | "cisco_nxos" | "cisco_xr" => Arc::new(CiscoIos {
            tag: device_type.to_string(),
        }),
        "cisco_asa" => Arc::new(CiscoAsa),
        "arista_eos" => Arc::new(AristaEos),
        "juniper" | "juniper_junos" => Arc::new(Juniper {
            tag: device_type.to_string(),
        }),
        "hp_procurve" => Arc::new(HpProcurve),
        "hp_comware" => Arc::new(HpComware),
        "linux" => Arc::new(Linux),
        other => Arc::new(Generic {
            tag: other.to_string(),
        }),
    }
}

/// Whether the tag maps to a dedicated dialect
pub fn is_known_device_type(device_type: &str) -> bool {
    KNOWN_DEVICE_TYPES.contains(&device_type)
}
