//! Frame rates and timecode formatting.
//!
//! Timecodes are derived from a non-negative frame count at a given [`Fps`],
//! or from an exact rational [`Clock`] time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul};

use crate::error::{DeliveryError, DeliveryResult};

/// Rational frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fps {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fps {
    pub const FPS_24: Fps = Fps::integral(24);
    pub const FPS_25: Fps = Fps::integral(25);
    pub const FPS_30: Fps = Fps::integral(30);
    pub const FPS_23_976: Fps = Fps {
        numerator: 24_000,
        denominator: 1001,
    };
    pub const FPS_29_97: Fps = Fps {
        numerator: 30_000,
        denominator: 1001,
    };

    pub const fn integral(fps: u32) -> Self {
        Self {
            numerator: fps,
            denominator: 1,
        }
    }

    pub fn new(numerator: u32, denominator: u32) -> DeliveryResult<Self> {
        if numerator == 0 || denominator == 0 {
            return Err(DeliveryError::configuration(format!(
                "frame rate {numerator}/{denominator} must be positive"
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn as_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    pub fn is_fractional(self) -> bool {
        self.numerator % self.denominator != 0
    }

    /// Rounded-up integer frame rate used by SMPTE non-drop-frame counters.
    pub fn int_fps(self) -> u64 {
        ceil_div(self.numerator as u64, self.denominator as u64)
    }

    pub fn supports_drop_frame(self) -> bool {
        self.denominator == 1001 && self.numerator % 15_000 == 0
    }

    /// Frame rate multiplied by an integer factor.
    pub fn scaled(self, factor: u32) -> Self {
        Self {
            numerator: self.numerator * factor,
            denominator: self.denominator,
        }
    }
}

impl fmt::Display for Fps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

/// How frame counts are rendered as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimecodeFormat {
    #[default]
    SmpteNonDropFrame,
    SmpteDropFrame,
    ExactFramesInSecond,
    Clock,
    Frames,
}

/// Exact rational time in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    pub numerator: u64,
    pub denominator: u64,
}

impl Clock {
    pub fn new(numerator: u64, denominator: u64) -> Self {
        assert!(denominator > 0, "clock denominator must be positive");
        Self {
            numerator,
            denominator,
        }
    }

    pub fn from_frames(frames: u64, fps: Fps) -> Self {
        Self::new(frames * fps.denominator as u64, fps.numerator as u64)
    }

    pub fn seconds(self) -> u64 {
        self.numerator / self.denominator
    }

    /// Frame that contains this instant.
    pub fn to_frames(self, fps: Fps) -> u64 {
        (self.numerator as u128 * fps.numerator as u128
            / (self.denominator as u128 * fps.denominator as u128)) as u64
    }

    /// Frames needed to cover this much time.
    pub fn to_frames_ceil(self, fps: Fps) -> u64 {
        (self.numerator as u128 * fps.numerator as u128)
            .div_ceil(self.denominator as u128 * fps.denominator as u128) as u64
    }

    /// Time in (fractional) frames at `fps`.
    pub fn frames_f64(self, fps: Fps) -> f64 {
        self.numerator as f64 * fps.numerator as f64
            / (self.denominator as f64 * fps.denominator as f64)
    }

    /// Same time with numerator and denominator in lowest terms.
    pub fn reduced(self) -> Clock {
        let g = gcd(self.numerator, self.denominator);
        Clock::new(self.numerator / g, self.denominator / g)
    }

    pub fn later(self, other: Clock) -> Clock {
        let lhs = self.numerator as u128 * other.denominator as u128;
        let rhs = other.numerator as u128 * self.denominator as u128;
        if lhs >= rhs {
            self
        } else {
            other
        }
    }
}

impl Add for Clock {
    type Output = Clock;

    fn add(self, other: Clock) -> Clock {
        if self.denominator == other.denominator {
            return Clock::new(self.numerator + other.numerator, self.denominator);
        }
        let g = gcd(self.denominator, other.denominator);
        Clock::new(
            other.denominator / g * self.numerator + self.denominator / g * other.numerator,
            self.denominator / g * other.denominator,
        )
    }
}

impl Mul<u64> for Clock {
    type Output = Clock;

    fn mul(self, n: u64) -> Clock {
        Clock::new(self.numerator * n, self.denominator)
    }
}

impl Div<u64> for Clock {
    type Output = Clock;

    fn div(self, n: u64) -> Clock {
        Clock::new(self.numerator, self.denominator * n)
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.seconds();
        let millis = (self.numerator as u128 * 1000 / self.denominator as u128) % 1000;
        write!(
            f,
            "{:02}:{:02}:{:02}.{:03}",
            seconds / 3600 % 24,
            seconds / 60 % 60,
            seconds % 60,
            millis
        )
    }
}

/// A seconds-plus-frames timecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondsAndFrames {
    pub seconds: u64,
    pub frames: u64,
    separator: char,
}

impl SecondsAndFrames {
    /// Format with as many frame digits as the frame rate needs, at least two.
    pub fn format(&self, fps: Fps) -> String {
        let digits = ((fps.int_fps().saturating_sub(1)).to_string().len()).max(2);
        format!(
            "{:02}:{:02}:{:02}{}{:0digits$}",
            self.seconds / 3600,
            self.seconds / 60 % 60,
            self.seconds % 60,
            self.separator,
            self.frames,
        )
    }
}

/// Each second gets the same amount of frames, even when the clock drifts.
pub fn smpte_non_drop_frame(frames: u64, fps: Fps) -> SecondsAndFrames {
    let int_fps = fps.int_fps();
    SecondsAndFrames {
        seconds: frames / int_fps,
        frames: frames % int_fps,
        separator: ':',
    }
}

/// SMPTE drop-frame counting; only defined for NTSC-style rates.
pub fn smpte_drop_frame(frames: u64, fps: Fps) -> DeliveryResult<SecondsAndFrames> {
    if !fps.supports_drop_frame() {
        return Err(DeliveryError::configuration(format!(
            "{fps} fps does not support drop-frame timecode"
        )));
    }
    let int_fps = fps.numerator as u64 / 1000;
    // Frame numbers skipped every minute except each tenth minute.
    let drop = int_fps / 15;
    let per_minute = int_fps * 60;
    let per_cycle = 9 * (per_minute - drop) + per_minute;
    let in_cycle = frames % per_cycle;
    let minute_drops = if in_cycle >= drop {
        drop * ((in_cycle - drop) / (per_minute - drop))
    } else {
        0
    };
    let counted = frames + drop * 9 * (frames / per_cycle) + minute_drops;
    Ok(SecondsAndFrames {
        seconds: counted / int_fps,
        frames: counted % int_fps,
        separator: ';',
    })
}

/// Each second gets exactly the frames that start inside it.
pub fn exact_frames_in_second(frames: u64, fps: Fps) -> SecondsAndFrames {
    let (num, den) = (fps.numerator as u64, fps.denominator as u64);
    let seconds = frames * den / num;
    SecondsAndFrames {
        seconds,
        frames: frames - ceil_div(seconds * num, den),
        separator: '+',
    }
}

/// Render a frame count in the requested format.
pub fn format_timecode(fps: Fps, format: TimecodeFormat, frames: u64) -> DeliveryResult<String> {
    Ok(match format {
        TimecodeFormat::SmpteNonDropFrame => smpte_non_drop_frame(frames, fps).format(fps),
        TimecodeFormat::SmpteDropFrame => smpte_drop_frame(frames, fps)?.format(fps),
        TimecodeFormat::ExactFramesInSecond => exact_frames_in_second(frames, fps).format(fps),
        TimecodeFormat::Clock => Clock::from_frames(frames, fps).to_string(),
        TimecodeFormat::Frames => format!("{frames:06}"),
    })
}

pub fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
