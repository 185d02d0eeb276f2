//! Reference apps shipped with the soot binary.
//!
//! Small, stateful examples of the app contract; the end-to-end tests and
//! the demo deployment run against these.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use soot_app::{App, AppRegistry, Args, Kwargs, Outcome};
use soot_protocol::Value;

/// A counter that persists across requests within one worker.
pub struct CounterApp {
    total: Mutex<i64>,
}

impl App for CounterApp {
    fn dispatch(&self, action: &str, args: &Args, _kwargs: &Kwargs) -> anyhow::Result<Outcome> {
        let mut total = self.total.lock().unwrap_or_else(PoisonError::into_inner);
        match action {
            "increment" => {
                let step = args.first().and_then(Value::as_i64).unwrap_or(1);
                *total += step;
                Ok(Outcome::Value(Value::Int(*total)))
            }
            "current" => Ok(Outcome::Value(Value::Int(*total))),
            "reset" => {
                *total = 0;
                Ok(Outcome::Value(Value::Null))
            }
            other => bail!("unknown action: {other}"),
        }
    }
}

/// Streaming examples: a short letter sequence and a counting stream.
pub struct StreamApp;

impl App for StreamApp {
    fn dispatch(&self, action: &str, args: &Args, _kwargs: &Kwargs) -> anyhow::Result<Outcome> {
        match action {
            "letters" => Ok(Outcome::Stream(Box::new(["a", "b", "c"].into_iter().map(
                |letter| {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(Value::from(letter))
                },
            )))),
            "count" => {
                let upto = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(Outcome::Stream(Box::new((0..upto).map(|n| Ok(Value::Int(n))))))
            }
            other => bail!("unknown action: {other}"),
        }
    }
}

/// Blocks for a requested duration; exercises deadlines.
pub struct SleepApp;

impl App for SleepApp {
    fn dispatch(&self, action: &str, args: &Args, _kwargs: &Kwargs) -> anyhow::Result<Outcome> {
        match action {
            "sleep" => {
                let seconds = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
                Ok(Outcome::Value(Value::Float(seconds)))
            }
            other => bail!("unknown action: {other}"),
        }
    }
}

/// The registry every soot process (arbiter and workers alike) runs with.
pub fn builtin_registry() -> anyhow::Result<AppRegistry> {
    let mut registry = AppRegistry::new();
    registry.register("counter:CounterApp", || CounterApp {
        total: Mutex::new(0),
    })?;
    registry.register("stream:StreamApp", || StreamApp)?;
    registry.register("sleep:SleepApp", || SleepApp)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let registry = builtin_registry().unwrap();
        let app = registry.instantiate("counter:CounterApp").unwrap();

        let result = app
            .dispatch("increment", &[Value::Int(5)], &Kwargs::new())
            .unwrap();
        assert!(matches!(result, Outcome::Value(Value::Int(5))));
        let result = app
            .dispatch("increment", &[Value::Int(1)], &Kwargs::new())
            .unwrap();
        assert!(matches!(result, Outcome::Value(Value::Int(6))));
    }

    #[test]
    fn stream_counts() {
        let registry = builtin_registry().unwrap();
        let app = registry.instantiate("stream:StreamApp").unwrap();
        match app
            .dispatch("count", &[Value::Int(3)], &Kwargs::new())
            .unwrap()
        {
            Outcome::Stream(stream) => {
                let values: Vec<Value> = stream.map(Result::unwrap).collect();
                assert_eq!(values, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
            }
            Outcome::Value(_) => panic!("expected a stream"),
        }
    }

    #[test]
    fn unknown_action_errors() {
        let registry = builtin_registry().unwrap();
        let app = registry.instantiate("sleep:SleepApp").unwrap();
        assert!(app.dispatch("jog", &[], &Kwargs::new()).is_err());
    }
}
