use crate::request::IoReqHandle;
use crate::Result;

/// Callbacks into the storage controller that owns the requests.
///
/// Every callback receives the request's trailing bytes. They are exclusively borrowed for the
/// duration of the call; the engine never looks at them. Callbacks may run on any thread and
/// may re-enter the driver, except that a callback must not ask the driver for the trailing
/// bytes of the request it was called for.
pub trait MediaExPort: Send + Sync {
    /// Copies controller data for a write into `dst`, starting `offset` bytes into the
    /// request's data.
    fn io_req_copy_from_buf(
        &self,
        req: IoReqHandle,
        alloc: &mut [u8],
        offset: usize,
        dst: &mut [u8],
    ) -> Result<()>;

    /// Copies data of a completed read from `src` into the controller's buffers.
    fn io_req_copy_to_buf(
        &self,
        req: IoReqHandle,
        alloc: &mut [u8],
        offset: usize,
        src: &[u8],
    ) -> Result<()>;

    /// Reports the outcome of a request that completed after its submission call returned.
    ///
    /// Called exactly once per such request. The controller may free the request from here.
    fn io_req_complete_notify(&self, req: IoReqHandle, alloc: &mut [u8], result: Result<()>);
}
