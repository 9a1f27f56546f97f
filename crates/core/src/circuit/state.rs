use super::types::{CircuitId, CircuitState};
use onioncell_common::{OnionError, Result};
use tokio::sync::watch;

/// Circuit state plus a broadcast to everyone waiting on it.
///
/// `Destroyed` is sticky: once set, later `set` calls are ignored.
#[derive(Debug)]
pub struct StateWatch {
    circuit: CircuitId,
    tx: watch::Sender<CircuitState>,
}

impl StateWatch {
    pub fn new(circuit: CircuitId) -> Self {
        let (tx, _rx) = watch::channel(CircuitState::None);
        Self { circuit, tx }
    }

    pub fn get(&self) -> CircuitState {
        *self.tx.borrow()
    }

    /// Move to `new` and wake all waiters. Returns the previous state, or
    /// `None` when the circuit was already destroyed.
    pub fn set(&self, new: CircuitState) -> Option<CircuitState> {
        let mut previous = None;
        self.tx.send_if_modified(|state| {
            if *state == CircuitState::Destroyed {
                return false;
            }
            previous = Some(*state);
            *state = new;
            true
        });
        previous
    }

    pub fn subscribe(&self) -> StateWaiter {
        StateWaiter {
            circuit: self.circuit,
            rx: self.tx.subscribe(),
        }
    }
}

/// Handle for waiting on a circuit state.
///
/// Take one before sending the cell whose answer you want to wait for, so the
/// transition cannot slip past unobserved.
#[derive(Debug)]
pub struct StateWaiter {
    circuit: CircuitId,
    rx: watch::Receiver<CircuitState>,
}

impl StateWaiter {
    /// Resolve once the state equals `desired`.
    ///
    /// Fails with `CircuitDestroyed` if the circuit is destroyed first.
    pub async fn wait_for(&mut self, desired: CircuitState) -> Result<()> {
        loop {
            let current = *self.rx.borrow_and_update();
            if current == desired {
                return Ok(());
            }
            if current == CircuitState::Destroyed {
                return Err(OnionError::CircuitDestroyed(self.circuit.as_u32()));
            }
            if self.rx.changed().await.is_err() {
                return Err(OnionError::CircuitDestroyed(self.circuit.as_u32()));
            }
        }
    }

    /// Like `wait_for`, but if the state already equals `desired`, wait for
    /// it to be entered again after the next transition.
    pub async fn wait_for_next(&mut self, desired: CircuitState) -> Result<()> {
        let current = *self.rx.borrow_and_update();
        if current == desired && self.rx.changed().await.is_err() {
            return Err(OnionError::CircuitDestroyed(self.circuit.as_u32()));
        }
        self.wait_for(desired).await
    }

    pub fn current(&self) -> CircuitState {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_destroyed_is_terminal() {
        let state = StateWatch::new(CircuitId(1));
        assert_eq!(state.set(CircuitState::Creating), Some(CircuitState::None));
        assert_eq!(state.set(CircuitState::Destroyed), Some(CircuitState::Creating));
        assert_eq!(state.set(CircuitState::Ready), None);
        assert_eq!(state.get(), CircuitState::Destroyed);
    }

    #[tokio::test]
    async fn test_waiter_sees_transition() {
        let state = std::sync::Arc::new(StateWatch::new(CircuitId(1)));
        let mut waiter = state.subscribe();

        let setter = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(CircuitState::Creating);
            setter.set(CircuitState::Ready);
        });

        tokio::time::timeout(Duration::from_secs(1), waiter.wait_for(CircuitState::Ready))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiter_fails_on_destroy() {
        let state = std::sync::Arc::new(StateWatch::new(CircuitId(7)));
        let mut waiter = state.subscribe();

        let setter = state.clone();
        tokio::spawn(async move {
            setter.set(CircuitState::Destroyed);
        });

        let err = waiter.wait_for(CircuitState::Ready).await.unwrap_err();
        assert!(matches!(err, OnionError::CircuitDestroyed(7)));
    }

    #[tokio::test]
    async fn test_already_in_state_returns_immediately() {
        let state = StateWatch::new(CircuitId(1));
        state.set(CircuitState::Ready);
        state.subscribe().wait_for(CircuitState::Ready).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_next_requires_reentry() {
        let state = std::sync::Arc::new(StateWatch::new(CircuitId(1)));
        state.set(CircuitState::Ready);
        let mut waiter = state.subscribe();

        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            waiter.wait_for_next(CircuitState::Ready),
        )
        .await;
        assert!(pending.is_err());

        let mut waiter = state.subscribe();
        let setter = state.clone();
        tokio::spawn(async move {
            setter.set(CircuitState::Extending);
            setter.set(CircuitState::Ready);
        });
        tokio::time::timeout(Duration::from_secs(1), waiter.wait_for_next(CircuitState::Ready))
            .await
            .unwrap()
            .unwrap();
    }
}
