use actionkit_protocol::{ActionType, HarnessError, HarnessResult, Measurement};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Wall-clock window around one execution.
#[derive(Debug, Clone)]
pub struct TimingListener {
    subject: ActionType,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimingListener {
    pub fn new(subject: ActionType) -> Self {
        Self {
            subject,
            start: None,
            end: None,
        }
    }

    pub fn listen<F>(&mut self, work: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        self.start = Some(Utc::now());
        let value = work()?;
        self.end = Some(Utc::now());
        Ok(value)
    }

    pub fn result(&self) -> HarnessResult<Measurement> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok(Measurement {
                subject: self.subject.clone(),
                start,
                end,
            }),
            _ => Err(HarnessError::NotExecuted(self.subject.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn completed_window_yields_measurement() -> Result<()> {
        let mut listener = TimingListener::new(ActionType::new("Root"));
        let value = listener.listen(|| Ok(Value::from(7)))?;
        assert_eq!(value, Value::from(7));

        let measurement = listener.result()?;
        assert_eq!(measurement.subject.as_str(), "Root");
        assert!(measurement.end >= measurement.start);
        Ok(())
    }

    #[test]
    fn failed_work_leaves_window_open() {
        let mut listener = TimingListener::new(ActionType::new("Root"));
        let err = listener.listen(|| Err(anyhow!("boom"))).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(matches!(
            listener.result(),
            Err(HarnessError::NotExecuted(ty)) if ty.as_str() == "Root"
        ));
    }

    #[test]
    fn result_before_listen_is_not_executed() {
        let listener = TimingListener::new(ActionType::new("Root"));
        assert!(listener.result().is_err());
    }
}
