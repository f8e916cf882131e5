use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::NativeObject;
use crate::value::{make_number_value, Value};

/// `clock()`: seconds since the Unix epoch, as a double.
pub struct Clock;

impl NativeObject for Clock {
    fn call(&self, _args: &[Value]) -> Result<Value, String> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| "System clock is before the Unix epoch.".to_string())?;
        Ok(make_number_value(elapsed.as_secs_f64()))
    }
}
