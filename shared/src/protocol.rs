//! Peripheral wire protocol
//!
//! Outbound schedule frames are ASCII lines, one per dose period:
//! ```text
//! M:08:00\n   morning
//! A:13:30\n   afternoon
//! N:21:15\n   night
//! ```
//! Inbound lines acknowledge schedule entries ("Morning time set
//! successfully") or carry reminders ("Reminder: ...").

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Prefix of reminder lines pushed by the peripheral
pub const REMINDER_PREFIX: &str = "Reminder:";

/// Dose period of a schedule entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Morning,
    Afternoon,
    Night,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Morning, Period::Afternoon, Period::Night];

    /// Single-letter tag used in outbound frames
    pub fn tag(self) -> char {
        match self {
            Period::Morning => 'M',
            Period::Afternoon => 'A',
            Period::Night => 'N',
        }
    }

    /// Period for an outbound frame tag
    pub fn from_tag(tag: char) -> Option<Self> {
        Period::ALL.into_iter().find(|p| p.tag() == tag)
    }

    /// Substring the firmware echoes once the entry is stored
    pub fn acknowledgement(self) -> &'static str {
        match self {
            Period::Morning => "Morning time set successfully",
            Period::Afternoon => "Afternoon time set successfully",
            Period::Night => "Night time set successfully",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Period::Morning => "morning",
            Period::Afternoon => "afternoon",
            Period::Night => "night",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Morning => write!(f, "Morning"),
            Period::Afternoon => write!(f, "Afternoon"),
            Period::Night => write!(f, "Night"),
        }
    }
}

/// Wall-clock time of day with minute resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduleTime {
    hour: u8,
    minute: u8,
}

impl ScheduleTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ProtocolError> {
        if hour > 23 || minute > 59 {
            return Err(ProtocolError::InvalidTime(format!("{}:{}", hour, minute)));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for ScheduleTime {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidTime(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

/// Build the outbound frame for one schedule entry
pub fn schedule_command(period: Period, time: ScheduleTime) -> String {
    format!("{}:{}\n", period.tag(), time)
}

/// The three daily dose times
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoseSchedule {
    pub morning: Option<ScheduleTime>,
    pub afternoon: Option<ScheduleTime>,
    pub night: Option<ScheduleTime>,
}

impl DoseSchedule {
    pub fn set(&mut self, period: Period, time: ScheduleTime) {
        match period {
            Period::Morning => self.morning = Some(time),
            Period::Afternoon => self.afternoon = Some(time),
            Period::Night => self.night = Some(time),
        }
    }

    pub fn get(&self, period: Period) -> Option<ScheduleTime> {
        match period {
            Period::Morning => self.morning,
            Period::Afternoon => self.afternoon,
            Period::Night => self.night,
        }
    }

    pub fn is_complete(&self) -> bool {
        Period::ALL.iter().all(|p| self.get(*p).is_some())
    }

    /// Frames in send order; refuses a partially filled schedule
    pub fn commands(&self) -> Result<Vec<String>, ProtocolError> {
        Period::ALL
            .iter()
            .map(|&period| {
                self.get(period)
                    .map(|time| schedule_command(period, time))
                    .ok_or(ProtocolError::IncompleteSchedule(period.label()))
            })
            .collect()
    }
}

/// What an inbound text line means to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// Firmware stored a schedule entry
    Acknowledged(Period),
    /// Firmware asks the user to take a dose; payload is the whole line
    Reminder(String),
    /// Anything else; only shown in the terminal
    Plain,
}

/// Classify an inbound text line
pub fn classify(text: &str) -> InboundKind {
    for period in Period::ALL {
        if text.contains(period.acknowledgement()) {
            return InboundKind::Acknowledged(period);
        }
    }

    if text.starts_with(REMINDER_PREFIX) {
        return InboundKind::Reminder(text.trim_end_matches(['\r', '\n']).to_string());
    }

    InboundKind::Plain
}
