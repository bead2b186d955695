use four_cc::FourCC;

// -------------------------------------------------------------------------------------------------

/// A parameter value change, as delivered to [`ParameterListeners`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterChange {
    /// Id of the changed parameter.
    pub id: FourCC,
    /// Position colour the parameter belongs to, `None` for global parameters.
    pub colour: Option<usize>,
    /// The new plain parameter value. Boolean values are passed as 0.0 or 1.0.
    pub value: f32,
}

// -------------------------------------------------------------------------------------------------

/// Handle of a subscribed listener, used to unsubscribe it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&ParameterChange) + Send + Sync>;

/// A set of parameter change handlers.
///
/// Handlers are called on the thread which applied the change, in subscription order.
#[derive(Default)]
pub struct ParameterListeners {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

impl ParameterListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Register a new change handler.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&ParameterChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a previously registered handler. Returns false if the id is unknown.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let count = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != count
    }

    /// Pass the change to all registered handlers.
    pub fn notify(&self, change: &ParameterChange) {
        for (_, listener) in &self.listeners {
            listener(change);
        }
    }
}

impl std::fmt::Debug for ParameterListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterListeners")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// -------------------------------------------------------------------------------------------------
