//! Grbl error, alarm, and setting decoders
//! Converts numeric error/alarm codes and setting keys to human-readable text

/// Decode a Grbl v1.1 error code to its message
pub fn decode_error(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("G-code words consist of a letter and a value. Letter was not found."),
        2 => Some("Numeric value format is not valid or missing an expected value."),
        3 => Some("Grbl '$' system command was not recognized or supported."),
        4 => Some("Negative value received for an expected positive value."),
        5 => Some("Homing cycle is not enabled via settings."),
        6 => Some("Minimum step pulse time must be greater than 3usec."),
        7 => Some("EEPROM read failed. Reset and restored to default values."),
        8 => Some("Grbl '$' command cannot be used unless Grbl is IDLE. Ensures smooth operation during a job."),
        9 => Some("G-code locked out during alarm or jog state."),
        10 => Some("Soft limits cannot be enabled without homing also enabled."),
        11 => Some("Max characters per line exceeded. Line was not processed and executed."),
        12 => Some("Grbl '$' setting value exceeds the maximum step rate supported."),
        13 => Some("Safety door detected as opened and door state initiated."),
        14 => Some("Build info or startup line exceeded EEPROM line length limit."),
        15 => Some("Jog target exceeds machine travel. Command ignored."),
        16 => Some("Jog command with no '=' or contains prohibited g-code."),
        17 => Some("Laser mode requires PWM output."),
        20 => Some("Unsupported or invalid g-code command found in block."),
        21 => Some("More than one g-code command from same modal group found in block."),
        22 => Some("Feed rate has not yet been set or is undefined."),
        23 => Some("G-code command in block requires an integer value."),
        24 => Some("Two G-code commands that both require the use of the XYZ axis words were detected in the block."),
        25 => Some("A G-code word was repeated in the block."),
        26 => Some("A G-code command implicitly or explicitly requires XYZ axis words in the block, but none were detected."),
        27 => Some("N line number value is not within the valid range of 1 - 9,999,999."),
        28 => Some("A G-code command was sent, but is missing some required P or L value words in the line."),
        29 => Some("Grbl supports six work coordinate systems G54-G59. G59.1, G59.2, and G59.3 are not supported."),
        30 => Some("The G53 G-code command requires either a G0 seek or G1 feed motion mode to be active."),
        31 => Some("There are unused axis words in the block and G80 motion mode cancel is active."),
        32 => Some("A G2 or G3 arc was commanded but there are no XYZ axis words in the selected plane to trace the arc."),
        33 => Some("The motion command has an invalid target. G2, G3, and G38.2 generates this error if the arc is impossible to generate or if the probe target is the current position."),
        34 => Some("A G2 or G3 arc, traced with the radius definition, had a mathematical error when computing the arc geometry."),
        35 => Some("A G2 or G3 arc, traced with the offset definition, is missing the IJK offset word in the selected plane to trace the arc."),
        36 => Some("There are unused, leftover G-code words that aren't used by any command in the block."),
        37 => Some("The G43.1 dynamic tool length offset command cannot apply an offset to an axis other than its configured axis."),
        38 => Some("Tool number greater than max supported value."),
        _ => None,
    }
}

/// Decode a Grbl v1.1 alarm code to its message
pub fn decode_alarm(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("Hard limit triggered. Machine position is likely lost due to sudden and immediate halt. Re-homing is highly recommended."),
        2 => Some("G-code motion target exceeds machine travel. Machine position safely retained. Alarm may be unlocked."),
        3 => Some("Reset while in motion. Grbl cannot guarantee position. Lost steps are likely. Re-homing is highly recommended."),
        4 => Some("Probe fail. The probe is not in the expected initial state before starting probe cycle, where G38.2 and G38.3 is not triggered and G38.4 and G38.5 is triggered."),
        5 => Some("Probe fail. Probe did not contact the workpiece within the programmed travel for G38.2 and G38.4."),
        6 => Some("Homing fail. Reset during active homing cycle."),
        7 => Some("Homing fail. Safety door was opened during active homing cycle."),
        8 => Some("Homing fail. Cycle failed to clear limit switch when pulling off. Try increasing pull-off setting or check wiring."),
        9 => Some("Homing fail. Could not find limit switch within search distance. Defined as 1.5 * max_travel on search and 5 * pulloff on locate phases."),
        _ => None,
    }
}

/// Metadata for a Grbl setting key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingInfo {
    /// Short setting name
    pub name: &'static str,
    /// Value units
    pub units: &'static str,
}

/// Look up the name and units for a `$N` setting key
pub fn setting_info(key: &str) -> Option<SettingInfo> {
    let info = |name, units| Some(SettingInfo { name, units });
    match key {
        "$0" => info("Step pulse time", "microseconds"),
        "$1" => info("Step idle delay", "milliseconds"),
        "$2" => info("Step pulse invert", "mask"),
        "$3" => info("Step direction invert", "mask"),
        "$4" => info("Invert step enable pin", "boolean"),
        "$5" => info("Invert limit pins", "boolean"),
        "$6" => info("Invert probe pin", "boolean"),
        "$10" => info("Status report options", "mask"),
        "$11" => info("Junction deviation", "millimeters"),
        "$12" => info("Arc tolerance", "millimeters"),
        "$13" => info("Report in inches", "boolean"),
        "$20" => info("Soft limits enable", "boolean"),
        "$21" => info("Hard limits enable", "boolean"),
        "$22" => info("Homing cycle enable", "boolean"),
        "$23" => info("Homing direction invert", "mask"),
        "$24" => info("Homing locate feed rate", "mm/min"),
        "$25" => info("Homing search seek rate", "mm/min"),
        "$26" => info("Homing switch debounce delay", "milliseconds"),
        "$27" => info("Homing switch pull-off distance", "millimeters"),
        "$30" => info("Maximum spindle speed", "RPM"),
        "$31" => info("Minimum spindle speed", "RPM"),
        "$32" => info("Laser-mode enable", "boolean"),
        "$100" => info("X-axis travel resolution", "step/mm"),
        "$101" => info("Y-axis travel resolution", "step/mm"),
        "$102" => info("Z-axis travel resolution", "step/mm"),
        "$110" => info("X-axis maximum rate", "mm/min"),
        "$111" => info("Y-axis maximum rate", "mm/min"),
        "$112" => info("Z-axis maximum rate", "mm/min"),
        "$120" => info("X-axis acceleration", "mm/sec^2"),
        "$121" => info("Y-axis acceleration", "mm/sec^2"),
        "$122" => info("Z-axis acceleration", "mm/sec^2"),
        "$130" => info("X-axis maximum travel", "millimeters"),
        "$131" => info("Y-axis maximum travel", "millimeters"),
        "$132" => info("Z-axis maximum travel", "millimeters"),
        _ => None,
    }
}

/// Format an error record for upstream display.
///
/// Known codes render as `error:20 (Unsupported or invalid g-code
/// command found in block.)`; unknown codes fall back to the raw line.
pub fn format_error(code: Option<u8>, raw: &str) -> String {
    match code.and_then(decode_error) {
        Some(message) => format!("error:{} ({})", code.unwrap_or_default(), message),
        None => raw.to_string(),
    }
}

/// Format an alarm record for upstream display.
pub fn format_alarm(code: Option<u8>, raw: &str) -> String {
    match code.and_then(decode_alarm) {
        Some(message) => format!("ALARM:{} ({})", code.unwrap_or_default(), message),
        None => raw.to_string(),
    }
}

/// Format a setting response for upstream display, with name and units
/// when the key is known.
pub fn format_setting(name: &str, value: &str, raw: &str) -> String {
    match setting_info(name) {
        Some(info) => format!("{}={} ({}, {})", name, value, info.name, info.units),
        None => raw.to_string(),
    }
}
