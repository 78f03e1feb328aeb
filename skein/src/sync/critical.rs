use core::marker::PhantomData;
use skein_kernel::Kernel;

/// Witness that the global critical section is held. Queue and shared-state
/// accessors take a key instead of acquiring anything themselves, so the
/// caller decides the extent of the section.
///
/// Keys are `Copy` but not `Send`: a key never outlives the section it was
/// issued for on the issuing thread.
#[derive(Copy, Clone)]
pub struct IrqKey<'cs> {
    _not_send: PhantomData<*mut ()>,
    _scope: PhantomData<&'cs ()>,
}

impl<'cs> IrqKey<'cs> {
    /// # Safety
    ///
    /// Interrupts must be disabled for the whole lifetime `'cs`.
    pub unsafe fn assume() -> IrqKey<'cs> {
        IrqKey {
            _not_send: PhantomData,
            _scope: PhantomData,
        }
    }
}

/// Runs `f` inside the kernel's global critical section.
pub fn with_interrupts_disabled<R>(
    kernel: &dyn Kernel,
    f: impl for<'cs> FnOnce(IrqKey<'cs>) -> R,
) -> R {
    let state = kernel.disable_interrupts();
    let result = f(unsafe { IrqKey::assume() });
    kernel.restore_interrupts(state);
    result
}
