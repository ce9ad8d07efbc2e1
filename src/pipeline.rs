/// Protocol logic plugged into a [`Pipeline`].
///
/// Hooks run on the channel's loop worker, one at a time. The channel releases its handle to the
/// inbound buffer once the pass finishes, so a handler that wants to keep it takes its own with
/// [`Buffer::retain`](crate::Buffer::retain) or copies it (`duplicate`/`slice`). Once retained,
/// the buffer is read-only for later handlers in the same pass. Handlers must not send or call `process_write` from their own `on_write`;
/// nothing here stops the recursion that follows.
#[async_trait::async_trait(?Send)]
pub trait Handler: Send {
    async fn on_read(&self, buffer: &mut crate::Buffer, channel: &crate::Channel) -> Result<(), crate::Error>;

    async fn on_write(&self, buffer: &mut crate::Buffer, channel: &crate::Channel) -> Result<(), crate::Error> {
        let _ = (buffer, channel);
        Ok(())
    }
}

pub type ChannelListener = Box<dyn FnOnce(&crate::Channel) + Send>;

/// Ordered handler chain for one connection.
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Box<dyn Handler>>,
    connect_listeners: Vec<ChannelListener>,
    disconnect_listeners: Vec<ChannelListener>,
}

impl Pipeline {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_handler(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Runs once, when the channel owning this pipeline is constructed.
    pub fn on_connect(&mut self, listener: impl FnOnce(&crate::Channel) + Send + 'static) -> &mut Self {
        self.connect_listeners.push(Box::new(listener));
        self
    }

    /// Runs once, on the first disconnect of the channel owning this pipeline.
    pub fn on_disconnect(&mut self, listener: impl FnOnce(&crate::Channel) + Send + 'static) -> &mut Self {
        self.disconnect_listeners.push(Box::new(listener));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Passes `buffer` to every handler's `on_read`, in registration order. Stops at the first fault.
    pub async fn process_read(&self, buffer: &mut crate::Buffer, channel: &crate::Channel) -> Result<(), crate::Error> {
        for handler in &self.handlers {
            handler.on_read(buffer, channel).await?;
        }
        Ok(())
    }

    /// Passes `buffer` to every handler's `on_write`, in registration order. Stops at the first fault.
    pub async fn process_write(&self, buffer: &mut crate::Buffer, channel: &crate::Channel) -> Result<(), crate::Error> {
        for handler in &self.handlers {
            handler.on_write(buffer, channel).await?;
        }
        Ok(())
    }

    pub(crate) fn take_listeners(&mut self) -> (Vec<ChannelListener>, Vec<ChannelListener>) {
        (std::mem::take(&mut self.connect_listeners), std::mem::take(&mut self.disconnect_listeners))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handlers.len())
            .field("connect_listeners", &self.connect_listeners.len())
            .field("disconnect_listeners", &self.disconnect_listeners.len())
            .finish()
    }
}
