use tokio::sync::mpsc;

const COMMAND_QUEUE_DEPTH: usize = 16;

/// Requests from outside the control loop (status UI, CLI, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Skip the schedule and cooldown; still waits for bus silence.
    UploadNow,
    StartMonitoring,
    StopMonitoring,
    /// Wipe persisted upload state on the next boot and restart.
    ResetState,
}

/// Cloneable producer side of the command queue.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
}

impl CommandSender {
    /// Queue a command. Returns false if the queue is full or closed.
    pub fn send(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropped command {:?}: {}", command, e);
                false
            }
        }
    }
}

/// Single consumer, drained once per control-loop tick.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
}

impl CommandReceiver {
    pub fn drain(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            commands.push(command);
        }
        commands
    }
}

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    (CommandSender { tx }, CommandReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let (tx, mut rx) = command_channel();
        let other = tx.clone();
        assert!(tx.send(Command::StartMonitoring));
        assert!(other.send(Command::UploadNow));
        assert_eq!(rx.drain(), vec![Command::StartMonitoring, Command::UploadNow]);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_full_queue_drops() {
        let (tx, _rx) = command_channel();
        for _ in 0..COMMAND_QUEUE_DEPTH {
            assert!(tx.send(Command::UploadNow));
        }
        assert!(!tx.send(Command::UploadNow));
    }
}
