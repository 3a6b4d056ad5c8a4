//! Pure derived-value rules: grade math, schedule interval overlap, and
//! attendance aggregation. Everything here is deterministic and
//! infallible; range validation happens at the request boundary.

/// Canonical component weights: 30% daily work, 35% midterm, 35% final exam.
pub const DAILY_WEIGHT: f64 = 0.30;
pub const MIDTERM_WEIGHT: f64 = 0.35;
pub const FINAL_WEIGHT: f64 = 0.35;

/// Minimum final grade that counts as a pass.
pub const PASSING_GRADE: f64 = 70.0;

/// Half-up rounding to 2 decimal places: `Int(100*x + 0.5) / 100`.
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Weighted final grade from the three optional component scores.
/// Absent components degrade to 0; the calculator itself never fails.
pub fn final_grade(daily: Option<f64>, midterm: Option<f64>, final_exam: Option<f64>) -> f64 {
    let daily = daily.unwrap_or(0.0);
    let midterm = midterm.unwrap_or(0.0);
    let final_exam = final_exam.unwrap_or(0.0);
    round2(daily * DAILY_WEIGHT + midterm * MIDTERM_WEIGHT + final_exam * FINAL_WEIGHT)
}

/// Letter for a numeric final grade: >=90 A, >=80 B, >=70 C, >=60 D, else E.
pub fn letter_for(final_grade: f64) -> &'static str {
    if final_grade >= 90.0 {
        "A"
    } else if final_grade >= 80.0 {
        "B"
    } else if final_grade >= 70.0 {
        "C"
    } else if final_grade >= 60.0 {
        "D"
    } else {
        "E"
    }
}

pub fn is_passing(final_grade: f64) -> bool {
    final_grade >= PASSING_GRADE
}

/// Parse a lesson time of the form `HH:MM` into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<i64> {
    let (h, m) = s.trim().split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: i64 = h.parse().ok()?;
    let m: i64 = m.parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}

/// Half-open interval overlap: `[s1,e1)` and `[s2,e2)` conflict iff
/// `s1 < e2 && s2 < e1`. Exact boundary touches are not a conflict.
pub fn times_overlap(s1: i64, e1: i64, s2: i64, e2: i64) -> bool {
    s1 < e2 && s2 < e1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Sick,
    Permit,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            "sick" => Some(Self::Sick),
            // Older data used the long spelling.
            "permit" | "permission" => Some(Self::Permit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Sick => "sick",
            Self::Permit => "permit",
        }
    }

    /// Absence for reporting purposes is absent/sick/permit. Late counts
    /// toward the total but neither as present nor as an absence.
    pub fn counts_absent(self) -> bool {
        matches!(self, Self::Absent | Self::Sick | Self::Permit)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceTally {
    pub total: i64,
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub sick: i64,
    pub permit: i64,
}

impl AttendanceTally {
    pub fn record(&mut self, status: AttendanceStatus) {
        self.total += 1;
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Sick => self.sick += 1,
            AttendanceStatus::Permit => self.permit += 1,
        }
    }

    /// Present share of all records, in percent. Zero records is a valid
    /// state and yields 0, never NaN.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        round2(100.0 * (self.present as f64) / (self.total as f64))
    }

    pub fn absence_count(&self) -> i64 {
        self.absent + self.sick + self.permit
    }
}
