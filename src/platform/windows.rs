use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::psapi::EmptyWorkingSet;

pub fn empty_working_set() -> bool {
    // GetCurrentProcess returns a pseudo-handle that needs no closing.
    unsafe { EmptyWorkingSet(GetCurrentProcess()) != 0 }
}
