use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigurationError, MAX_TOTAL_SCORE};

/// Discrete risk levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Safe,
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `[min, max)` band of the threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdEntry {
    pub level: RiskLevel,
    pub min: u32,
    pub max: u32,
}

/// Ordered, contiguous bands covering `[0, max_score]`; the last band's upper
/// bound is inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholdTable {
    entries: Vec<ThresholdEntry>,
}

impl RiskThresholdTable {
    /// Build from explicit entries, rejecting anything that is not contiguous.
    pub fn new(entries: Vec<ThresholdEntry>) -> Result<Self, ConfigurationError> {
        let table = Self { entries };
        table.check_contiguous()?;
        Ok(table)
    }

    /// Build from a `level -> lower boundary` map; each band ends where the next
    /// begins and `critical` ends at [`MAX_TOTAL_SCORE`].
    pub fn from_boundaries(boundaries: &BTreeMap<RiskLevel, u32>) -> Result<Self, ConfigurationError> {
        let mut entries = Vec::with_capacity(RiskLevel::ALL.len());
        for (idx, level) in RiskLevel::ALL.iter().enumerate() {
            let min = *boundaries
                .get(level)
                .ok_or_else(|| ConfigurationError::MissingLevel {
                    level: level.to_string(),
                })?;
            let max = match RiskLevel::ALL.get(idx + 1) {
                Some(next) => *boundaries
                    .get(next)
                    .ok_or_else(|| ConfigurationError::MissingLevel {
                        level: next.to_string(),
                    })?,
                None => MAX_TOTAL_SCORE,
            };
            entries.push(ThresholdEntry {
                level: *level,
                min,
                max,
            });
        }
        Self::new(entries)
    }

    pub fn entries(&self) -> &[ThresholdEntry] {
        &self.entries
    }

    /// Inclusive upper bound of the table.
    pub fn max_score(&self) -> u32 {
        self.entries.last().map(|entry| entry.max).unwrap_or(0)
    }

    fn check_contiguous(&self) -> Result<(), ConfigurationError> {
        let first = self.entries.first().ok_or(ConfigurationError::EmptyTable)?;
        if first.min != 0 {
            return Err(ConfigurationError::DoesNotStartAtZero { min: first.min });
        }
        for (position, entry) in self.entries.iter().enumerate() {
            if RiskLevel::ALL.get(position) != Some(&entry.level) {
                return Err(ConfigurationError::LevelOutOfOrder {
                    level: entry.level.to_string(),
                    position,
                });
            }
            if entry.min >= entry.max {
                return Err(ConfigurationError::EmptyRange {
                    level: entry.level.to_string(),
                    min: entry.min,
                    max: entry.max,
                });
            }
        }
        if self.entries.len() != RiskLevel::ALL.len() {
            return Err(ConfigurationError::MissingLevel {
                level: RiskLevel::ALL[self.entries.len()].to_string(),
            });
        }
        for pair in self.entries.windows(2) {
            if pair[0].max != pair[1].min {
                return Err(ConfigurationError::NotContiguous {
                    previous: pair[0].level.to_string(),
                    end: pair[0].max,
                    next: pair[1].level.to_string(),
                    start: pair[1].min,
                });
            }
        }
        let actual = self.max_score();
        if actual != MAX_TOTAL_SCORE {
            return Err(ConfigurationError::DoesNotCoverMax {
                expected: MAX_TOTAL_SCORE,
                actual,
            });
        }
        Ok(())
    }

    pub fn lookup(&self, score: u32) -> Result<RiskLevel, ConfigurationError> {
        classify(score, self)
    }
}

impl Default for RiskThresholdTable {
    fn default() -> Self {
        let bounds = [0, 20, 40, 60, 80, MAX_TOTAL_SCORE];
        let entries = RiskLevel::ALL
            .iter()
            .enumerate()
            .map(|(idx, level)| ThresholdEntry {
                level: *level,
                min: bounds[idx],
                max: bounds[idx + 1],
            })
            .collect();
        Self { entries }
    }
}

/// Map a final score to its risk level.
///
/// Re-checks contiguity on every call so a malformed table is reported rather
/// than guessed around; tables built through [`RiskThresholdTable::new`] never
/// fail here for scores within `[0, max_score]`.
pub fn classify(score: u32, table: &RiskThresholdTable) -> Result<RiskLevel, ConfigurationError> {
    table.check_contiguous()?;
    let last = table.entries.len() - 1;
    table
        .entries
        .iter()
        .enumerate()
        .find(|(idx, entry)| {
            score >= entry.min && (score < entry.max || (*idx == last && score == entry.max))
        })
        .map(|(_, entry)| entry.level)
        .ok_or(ConfigurationError::ScoreOutOfRange { score })
}
