//! Boot-time VM settings, read from the kernel command line.
//!
//! The command line is a sequence of whitespace separated words. Words of the
//! form `key=value` set a value; bare words and keys this module does not know
//! about belong to someone else and are skipped.

use crate::mem::swap::{BlockSector, SECTORS_PER_PAGE};
use core::ops::Range;
use kidneyos_syscalls::EINVAL;
use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1, hex_digit1, multispace0},
    combinator::{all_consuming, map_res, rest},
    sequence::{preceded, separated_pair},
    IResult,
};

const SWAP_START: &str = "vm.swap_start";
const SWAP_SECTORS: &str = "vm.swap_sectors";
const CSTR_MAX: &str = "vm.cstr_max";
const TRACE: &str = "vm.trace";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// First sector of the swap area on the swap device.
    pub swap_start: BlockSector,
    /// Length of the swap area in sectors, header page included.
    pub swap_sectors: u32,
    /// Longest user string the validator will walk before giving up.
    pub cstr_max: usize,
    /// Log evictions and mapping changes.
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            swap_start: 10240,
            swap_sectors: kidneyos_shared::sizes::SWAP_SECTORS,
            cstr_max: 4096,
            trace: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A `key=value` word that could not be split, at this byte offset.
    Malformed { at: usize },
    /// The value given for `key` is not a number or out of range.
    BadValue { key: &'static str },
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Malformed { at } => write!(f, "malformed setting at offset {at}"),
            Self::BadValue { key } => write!(f, "bad value for {key}"),
        }
    }
}

impl core::error::Error for ConfigError {}

impl ConfigError {
    pub fn to_isize(self) -> isize {
        EINVAL
    }
}

fn word(input: &str) -> IResult<&str, &str> {
    preceded(multispace0, take_while1(|c: char| !c.is_ascii_whitespace()))(input)
}

fn setting(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(take_while1(|c: char| c != '='), char('='), rest)(input)
}

fn number(input: &str) -> IResult<&str, u32> {
    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |digits: &str| {
            u32::from_str_radix(digits, 16)
        }),
        map_res(digit1, |digits: &str| digits.parse::<u32>()),
    ))(input)
}

fn value(key: &'static str, input: &str) -> Result<u32, ConfigError> {
    all_consuming(number)(input)
        .map(|(_, n)| n)
        .map_err(|_| ConfigError::BadValue { key })
}

impl VmConfig {
    pub fn parse(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut input = cmdline;

        while let Ok((next, token)) = word(input) {
            let at = cmdline.len() - next.len() - token.len();
            input = next;

            if !token.contains('=') {
                continue;
            }

            let (_, (key, raw)) =
                all_consuming(setting)(token).map_err(|_| ConfigError::Malformed { at })?;

            match key {
                SWAP_START => config.swap_start = value(SWAP_START, raw)?,
                SWAP_SECTORS => config.swap_sectors = value(SWAP_SECTORS, raw)?,
                CSTR_MAX => config.cstr_max = value(CSTR_MAX, raw)? as usize,
                TRACE => {
                    config.trace = match value(TRACE, raw)? {
                        0 => false,
                        1 => true,
                        _ => return Err(ConfigError::BadValue { key: TRACE }),
                    }
                }
                _ => {}
            }
        }

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        // One page for the header, at least one slot after it.
        if self.swap_sectors % SECTORS_PER_PAGE != 0 || self.swap_sectors < 2 * SECTORS_PER_PAGE
        {
            return Err(ConfigError::BadValue { key: SWAP_SECTORS });
        }
        if self.swap_start.checked_add(self.swap_sectors).is_none() {
            return Err(ConfigError::BadValue { key: SWAP_SECTORS });
        }
        if self.cstr_max == 0 {
            return Err(ConfigError::BadValue { key: CSTR_MAX });
        }
        Ok(())
    }

    /// Sectors of the swap device owned by the VM.
    pub fn swap_area(&self) -> Range<BlockSector> {
        self.swap_start..self.swap_start + self.swap_sectors
    }
}
