//! IEEE-488.2 status registers.

use bitflags::bitflags;

bitflags! {
    /// Status Byte Register, as returned by a serial poll or `*STB?`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusByte: u8 {
        const MESSAGE_AVAILABLE = 1 << 4;
        const EVENT_SUMMARY = 1 << 5;
        const REQUESTING_SERVICE = 1 << 6;

        // Bits 0-3 and 7 are device specific and must survive a round trip
        const _ = !0;
    }
}

bitflags! {
    /// Standard Event Status Register (`*ESR?`) and its enable mask (`*ESE`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventStatus: u8 {
        const OPERATION_COMPLETE = 1 << 0;
        const REQUESTING_CONTROL = 1 << 1;
        const QUERY_ERROR = 1 << 2;
        const DEVICE_SPECIFIC_ERROR = 1 << 3;
        const EXECUTION_ERROR = 1 << 4;
        const COMMAND_ERROR = 1 << 5;
        const USER_REQUEST = 1 << 6;
        const POWERED_ON = 1 << 7;
    }
}

impl EventStatus {
    /// Any of the four error bits is set.
    pub fn has_error(self) -> bool {
        self.intersects(
            EventStatus::QUERY_ERROR
                | EventStatus::DEVICE_SPECIFIC_ERROR
                | EventStatus::EXECUTION_ERROR
                | EventStatus::COMMAND_ERROR,
        )
    }
}

/// Parse the decimal register value an instrument answers with (`"32"`, `"+32\n"`).
pub(crate) fn parse_register(text: &str) -> Option<u8> {
    let trimmed = text.trim().trim_start_matches('+');
    trimmed
        .parse::<u8>()
        .ok()
        .or_else(|| trimmed.parse::<f64>().ok().filter(|v| (0.0..=255.0).contains(v)).map(|v| v as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_status_bitmask_combination() {
        let combined = EventStatus::OPERATION_COMPLETE | EventStatus::COMMAND_ERROR;
        assert_eq!(combined.bits(), 0b0100001);
        assert!(combined.has_error());
        assert!(!EventStatus::OPERATION_COMPLETE.has_error());
    }

    #[test]
    fn test_status_byte_keeps_device_bits() {
        let stb = StatusByte::from_bits_retain(0b0101_0001);
        assert!(stb.contains(StatusByte::MESSAGE_AVAILABLE | StatusByte::REQUESTING_SERVICE));
        assert_eq!(stb.bits(), 0b0101_0001);
    }

    #[test]
    fn test_parse_register() {
        assert_eq!(parse_register("+32\r\n"), Some(32));
        assert_eq!(parse_register("64.0"), Some(64));
        assert_eq!(parse_register("garbage"), None);
    }
}
