/// Linear drift correction in millimetres.
pub fn correct_drift(reading_mm: f64, months: f64, drift_per_month: f64) -> f64 {
    reading_mm - months * drift_per_month
}
