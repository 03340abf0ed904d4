use crate::error::Result;
use validator::Validate;

/// Run derive-based validation, surfacing failures as a 400.
pub fn validate<T: Validate>(val: &T) -> Result<()> {
    val.validate()?;
    Ok(())
}
