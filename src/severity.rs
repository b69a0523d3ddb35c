use serde::Serialize;

/// Osteoarthritis severity grades predicted by the classifier.
///
/// The five values are ordinal and their indices match the model's output
/// classes exactly; they are never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SeverityGrade {
    Normal,
    Mild,
    Moderate,
    Severe,
    Advanced,
}

impl SeverityGrade {
    /// Number of severity classes in the model output.
    pub const COUNT: usize = 5;

    /// Map a classifier output index to its grade.
    pub fn from_index(index: usize) -> Option<SeverityGrade> {
        match index {
            0 => Some(SeverityGrade::Normal),
            1 => Some(SeverityGrade::Mild),
            2 => Some(SeverityGrade::Moderate),
            3 => Some(SeverityGrade::Severe),
            4 => Some(SeverityGrade::Advanced),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            SeverityGrade::Normal => 0,
            SeverityGrade::Mild => 1,
            SeverityGrade::Moderate => 2,
            SeverityGrade::Severe => 3,
            SeverityGrade::Advanced => 4,
        }
    }

    /// Stable display label stored in study metadata and shown to callers.
    pub fn label(&self) -> &'static str {
        match self {
            SeverityGrade::Normal => "Grade 1: Normal",
            SeverityGrade::Mild => "Grade 2: Mild osteoarthritis",
            SeverityGrade::Moderate => "Grade 3: Moderate osteoarthritis",
            SeverityGrade::Severe => "Grade 4: Severe osteoarthritis",
            SeverityGrade::Advanced => "Grade 5: Advanced osteoarthritis",
        }
    }

    /// All grades in ordinal order.
    pub fn all_grades() -> [SeverityGrade; Self::COUNT] {
        [
            SeverityGrade::Normal,
            SeverityGrade::Mild,
            SeverityGrade::Moderate,
            SeverityGrade::Severe,
            SeverityGrade::Advanced,
        ]
    }
}

impl std::fmt::Display for SeverityGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
