use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern.
///
/// The string values are exactly the ones accepted by the matching `CHECK`
/// constraint in the schema, so `ALL` doubles as the allowed-value list for
/// QA checks.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            /// Quoted, comma-separated values for an SQL `IN (...)` list.
            pub fn sql_list() -> String {
                Self::ALL
                    .iter()
                    .map(|v| format!("'{}'", v.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(FacilityType {
    Hospital => "Hospital",
    Clinic => "Clinic",
    ImagingCenter => "Imaging Center",
});

str_enum!(Gender {
    Male => "M",
    Female => "F",
    Other => "Other",
});

str_enum!(EncounterType {
    Outpatient => "Outpatient",
    Emergency => "Emergency",
    Inpatient => "Inpatient",
    UrgentCare => "Urgent Care",
    Observation => "Observation",
});

str_enum!(Modality {
    XRay => "X-Ray",
    Ct => "CT",
    Mri => "MRI",
    Ultrasound => "Ultrasound",
    Fluoroscopy => "Fluoroscopy",
    Mammography => "Mammography",
});

str_enum!(Laterality {
    Left => "Left",
    Right => "Right",
    Bilateral => "Bilateral",
    NotApplicable => "N/A",
});

str_enum!(Severity {
    Mild => "Mild",
    Moderate => "Moderate",
    Severe => "Severe",
    Critical => "Critical",
});

str_enum!(ReportType {
    Preliminary => "Preliminary",
    Final => "Final",
    Addendum => "Addendum",
});

str_enum!(ReportStatus {
    Draft => "Draft",
    Pending => "Pending",
    Signed => "Signed",
    Amended => "Amended",
});

str_enum!(AgeGroup {
    Pediatric => "Pediatric",
    YoungAdult => "Young Adult",
    MiddleAge => "Middle Age",
    Senior => "Senior",
    Elderly => "Elderly",
});

str_enum!(DiagnosisType {
    Primary => "Primary",
    Secondary => "Secondary",
});

impl Gender {
    /// Source datasets only distinguish M and F; anything else is `Other`.
    pub fn from_source(raw: &str) -> Self {
        match raw.trim() {
            "M" | "m" => Self::Male,
            "F" | "f" => Self::Female,
            _ => Self::Other,
        }
    }
}

impl AgeGroup {
    /// Bands: <18, 18–35, 36–55, 56–75, >75.
    pub fn for_age(age: i64) -> Self {
        match age {
            i64::MIN..=17 => Self::Pediatric,
            18..=35 => Self::YoungAdult,
            36..=55 => Self::MiddleAge,
            56..=75 => Self::Senior,
            _ => Self::Elderly,
        }
    }
}
