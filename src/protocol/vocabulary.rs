//! Firmware vocabulary.
//!
//! The control protocol's exchange pattern is fixed; its words are not. Parameter names,
//! command verbs, state names and routing values are firmware-defined, so they live in a
//! versioned, serde-loadable table rather than in the core. Defaults match the acq400
//! firmware family.

use regex::bytes::Regex as BytesRegex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::uut::DeviceState;

/// A `NAME=VALUE` parameter assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Setting {
    /// Parameter name
    pub name: String,
    /// Value written, and expected on read-back
    pub value: String,
}

impl Setting {
    /// Build a setting.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Wire form of the assignment.
    pub fn command(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

impl TryFrom<String> for Setting {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once('=') {
            Some((name, val)) if !name.trim().is_empty() => {
                Ok(Setting::new(name.trim(), val.trim()))
            }
            _ => Err(format!("expected NAME=VALUE, got {value:?}")),
        }
    }
}

impl From<Setting> for String {
    fn from(value: Setting) -> Self {
        value.command()
    }
}

fn settings(list: &[&str]) -> Vec<Setting> {
    list.iter()
        .filter_map(|s| Setting::try_from((*s).to_string()).ok())
        .collect()
}

/// Device state names, grouped by the state they map to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTable {
    /// Names reported while idle
    pub idle: Vec<String>,
    /// Names reported while armed and waiting for a trigger
    pub armed: Vec<String>,
    /// Names reported after the trigger, until the unit returns to idle
    pub triggered: Vec<String>,
}

impl Default for StateTable {
    fn default() -> Self {
        Self {
            idle: vec!["IDLE".into()],
            armed: vec!["ARM".into(), "RUNPRE".into()],
            triggered: vec!["RUNPOST".into(), "POSTPROCESS".into(), "CLEANUP".into()],
        }
    }
}

/// Routing writes per chain role. Each entry is also the read-back expectation.
///
/// The root gets its clock entries followed by its trigger entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingTable {
    /// Chain root triggered by soft trigger
    pub root_soft: Vec<Setting>,
    /// Chain root triggered from the front panel
    pub root_front_panel: Vec<Setting>,
    /// Chain root clocked internally and driving the clock downstream
    pub root_clock_internal: Vec<Setting>,
    /// Chain root clocked from the front panel and passing it downstream
    pub root_clock_front_panel: Vec<Setting>,
    /// Parameter taking the root's internal clock rate in Hz
    pub clock_rate_param: Option<String>,
    /// Member sourcing clock/trigger from its predecessor, re-driving downstream
    pub daisy_member: Vec<Setting>,
    /// Member sourcing clock/trigger from the dedicated HDMI master line
    pub hdmi_member: Vec<Setting>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            root_soft: settings(&[
                "SIG:SRC:TRG:1=STRIG",
                "SIG:SYNC_OUT:TRG=TRG",
                "SIG:SYNC_OUT:TRG:DX=d1",
            ]),
            root_front_panel: settings(&[
                "SIG:SRC:TRG:0=EXT",
                "SIG:SYNC_OUT:TRG=TRG",
                "SIG:SYNC_OUT:TRG:DX=d0",
            ]),
            root_clock_internal: settings(&[
                "SYS:CLK:FPMUX=ZCLK",
                "SIG:SYNC_OUT:CLK=CLK",
                "SIG:SYNC_OUT:CLK:DX=d1",
            ]),
            root_clock_front_panel: settings(&[
                "SYS:CLK:FPMUX=FPCLK",
                "SIG:SYNC_OUT:CLK=CLK",
                "SIG:SYNC_OUT:CLK:DX=d0",
            ]),
            clock_rate_param: Some("SIG:CLK_MB:SET".into()),
            daisy_member: settings(&[
                "SIG:SRC:CLK:1=HDMI",
                "SIG:SRC:TRG:0=HDMI",
                "SIG:SYNC_OUT:CLK=CLK",
                "SIG:SYNC_OUT:TRG=TRG",
            ]),
            hdmi_member: settings(&["SIG:SRC:CLK:1=HDMI", "SIG:SRC:TRG:0=HDMI"]),
        }
    }
}

/// Versioned firmware vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Contract version tag, logged on connect
    pub version: String,
    /// Commands sent once after connecting
    pub handshake: Vec<String>,
    /// Regex matching the prompt that terminates every reply
    pub prompt_pattern: String,
    /// Arm command
    pub arm: String,
    /// Soft trigger command
    pub soft_trigger: String,
    /// Abort command
    pub abort: String,
    /// Query returning the capture state
    pub state_query: String,
    /// State name mapping
    pub states: StateTable,
    /// Parameter carrying pre/post/trigger settings
    pub transient_param: String,
    /// Template rendered into `transient_param`; keys `pre`, `post`, `soft`
    pub transient_template: String,
    /// Parameter toggling simulated data, if the firmware has one
    pub simulate_param: Option<String>,
    /// Parameter reporting the channel count
    pub channel_count_param: String,
    /// Parameter reporting 32-bit sample width when `1`
    pub data32_param: String,
    /// Trigger/clock routing writes
    pub routing: RoutingTable,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            version: "acq400-1".into(),
            handshake: vec!["prompt on".into()],
            prompt_pattern: r"acq400\.[0-9]+ [0-9]+ >".into(),
            arm: "set_arm=1".into(),
            soft_trigger: "soft_trigger=1".into(),
            abort: "set_abort=1".into(),
            state_query: "TRANS_ACT:STATE".into(),
            states: StateTable::default(),
            transient_param: "transient".into(),
            transient_template: "PRE={pre} POST={post} SOFT_TRIGGER={soft}".into(),
            simulate_param: Some("simulate".into()),
            channel_count_param: "NCHAN".into(),
            data32_param: "data32".into(),
            routing: RoutingTable::default(),
        }
    }
}

impl Vocabulary {
    /// Compile the prompt sentinel.
    pub fn prompt_regex(&self) -> Result<BytesRegex, String> {
        BytesRegex::new(&self.prompt_pattern)
            .map_err(|e| format!("invalid prompt_pattern {:?}: {e}", self.prompt_pattern))
    }

    /// Map a reported state name.
    pub fn classify_state(&self, name: &str) -> Option<DeviceState> {
        let name = name.trim();
        let hit = |list: &[String]| list.iter().any(|s| s.eq_ignore_ascii_case(name));
        if hit(&self.states.idle) {
            Some(DeviceState::Idle)
        } else if hit(&self.states.armed) {
            Some(DeviceState::Armed)
        } else if hit(&self.states.triggered) {
            Some(DeviceState::Triggered)
        } else {
            None
        }
    }

    /// Render the transient parameter value.
    pub fn render_transient(&self, pre: u64, post: u64, soft: bool) -> Result<String, String> {
        let mut vars = HashMap::new();
        vars.insert("pre".to_string(), pre.to_string());
        vars.insert("post".to_string(), post.to_string());
        vars.insert("soft".to_string(), if soft { "1" } else { "0" }.to_string());
        strfmt::strfmt(&self.transient_template, &vars)
            .map_err(|e| format!("invalid transient_template: {e}"))
    }

    /// Check the table is usable before any connection is made.
    pub fn validate(&self) -> Result<(), String> {
        self.prompt_regex()?;
        self.render_transient(0, 1, true)?;
        for (what, value) in [
            ("arm", &self.arm),
            ("soft_trigger", &self.soft_trigger),
            ("abort", &self.abort),
            ("state_query", &self.state_query),
            ("transient_param", &self.transient_param),
        ] {
            if value.trim().is_empty() {
                return Err(format!("firmware.{what} must not be empty"));
            }
        }
        if self.states.idle.is_empty() || self.states.armed.is_empty() {
            return Err("firmware.states needs idle and armed names".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vocabulary_is_valid() {
        assert!(Vocabulary::default().validate().is_ok());
    }

    #[test]
    fn test_classify_state() {
        let v = Vocabulary::default();
        assert_eq!(v.classify_state("IDLE"), Some(DeviceState::Idle));
        assert_eq!(v.classify_state("RUNPRE"), Some(DeviceState::Armed));
        assert_eq!(v.classify_state("postprocess"), Some(DeviceState::Triggered));
        assert_eq!(v.classify_state("WEIRD"), None);
    }

    #[test]
    fn test_render_transient() {
        let v = Vocabulary::default();
        assert_eq!(
            v.render_transient(0, 1024, true).unwrap(),
            "PRE=0 POST=1024 SOFT_TRIGGER=1"
        );
    }

    #[test]
    fn test_setting_parse() {
        let s = Setting::try_from("SIG:SRC:TRG:0=HDMI".to_string()).unwrap();
        assert_eq!(s.name, "SIG:SRC:TRG:0");
        assert_eq!(s.value, "HDMI");
        assert!(Setting::try_from("novalue".to_string()).is_err());
    }

    #[test]
    fn test_prompt_regex_matches_acq400_prompt() {
        let re = Vocabulary::default().prompt_regex().unwrap();
        assert!(re.is_match(b"TRANS_ACT:STATE IDLE\nacq400.0 17 >"));
    }

    #[test]
    fn test_vocabulary_from_toml_overrides() {
        let v: Vocabulary = toml::from_str(
            r#"
            version = "custom-2"
            arm = "ARM=1"
            [routing]
            hdmi_member = ["TRG_SRC=BUS"]
            "#,
        )
        .unwrap();
        assert_eq!(v.version, "custom-2");
        assert_eq!(v.arm, "ARM=1");
        assert_eq!(v.routing.hdmi_member, vec![Setting::new("TRG_SRC", "BUS")]);
        // untouched sections keep defaults
        assert_eq!(v.state_query, "TRANS_ACT:STATE");
        assert_eq!(v.routing.daisy_member.len(), 4);
    }
}
