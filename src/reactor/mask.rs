use bitflags::bitflags;

bitflags! {
    /// Readiness and interest bits for a [`Channel`](crate::Channel).
    ///
    /// `READ` bundles the kernel's normal and urgent/priority readability
    /// bits; the pollers fold both into it when translating kernel events.
    /// `ERROR`, `HANGUP`, `INVALID` and `READ_HANGUP` are only ever
    /// *received*; requesting them as interest is meaningless to the kernel
    /// and they are ignored on that path.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EventMask: u32 {
        /// Data (normal or urgent) can be read.
        const READ = 1 << 0;
        /// Writing will not block.
        const WRITE = 1 << 1;
        /// Error condition on the descriptor.
        const ERROR = 1 << 2;
        /// Hang-up: the peer closed its end.
        const HANGUP = 1 << 3;
        /// The descriptor is not open.
        const INVALID = 1 << 4;
        /// The peer shut down the writing half of the connection.
        const READ_HANGUP = 1 << 5;
    }
}

impl EventMask {
    /// The mask a channel carries when it wants nothing delivered.
    pub fn none() -> EventMask {
        EventMask::empty()
    }
}
