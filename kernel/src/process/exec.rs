//! Program loading: fork and execv.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::convert::Infallible;

use crate::config::USER_STACK_TOP;
use crate::error::{KernelError, KernelResult};
use crate::fs::OpenFile;
use crate::process::context::Regs;
use crate::process::elf::ElfImage;
use crate::process::frame::build_argv_stack;
use crate::process::process::Entry;
use crate::process::resource::{Handle, Resource};
use crate::scheduler::Kernel;

impl Kernel {
    /// Replace the current program image.
    ///
    /// Returns only on failures detected before the old image is torn
    /// down. Afterwards the process runs the new program and exits with
    /// its result.
    pub fn execv(&self, path: &str, args: &[String]) -> KernelResult<Infallible> {
        let fs = self.filesystem().ok_or(KernelError::NotFound)?;
        let file = OpenFile::new(fs.lookup_file(path).ok_or(KernelError::NotFound)?);
        let image = ElfImage::read(&file)?;
        let (sp, stack) = build_argv_stack(USER_STACK_TOP, args)?;

        let me = self.running();
        log::info!("{}: execv {} ({} args)", me, path, args.len());
        me.set_name(path);
        me.address_space.exec();
        if let Err(err) = me.address_space.copy_out(sp, &stack) {
            self.exit(err.code());
        }
        self.reset_resources(me);
        me.signals.lock().reset_handlers();

        for seg in &image.segments {
            let mut bytes = vec![0u8; seg.p_memsz as usize];
            file.seek(seg.p_offset);
            if let Err(err) = file.read_fully(&mut bytes[..seg.p_filesz as usize]) {
                self.exit(err.code());
            }
            if let Err(err) = me.address_space.copy_out(seg.p_vaddr, &bytes) {
                self.exit(err.code());
            }
        }

        let code = self.enter_user(Regs::user_entry(image.entry, sp));
        self.exit(code)
    }

    /// Close every open resource of `me`, or detach from a shared table.
    fn reset_resources(&self, me: &crate::process::Process) {
        let closed = me.release_resources(self.config().resource_table_capacity);
        log::trace!("{}: closed {} resources", me, closed);
    }

    /// Duplicate the current process.
    ///
    /// The child gets copies of the resource table, signal dispositions
    /// and user memory, and resumes in user mode from `regs` with `eax`
    /// set to 0. The parent receives a handle to the child.
    pub fn fork(&self, regs: &Regs) -> KernelResult<Handle> {
        let me = self.running();
        let table = Arc::new(me.resources().duplicate());
        let mut child_regs = *regs;
        child_regs.eax = 0;

        let parent = self.current().map(|p| Arc::downgrade(&p));
        let child = self.spawn(&me.name(), Some(table), Entry::User(child_regs), parent);
        *child.signals.lock() = me.signals.lock().inherit();
        me.address_space.fork(&child.address_space);

        let handle = me.resources().open(Resource::Process(child.clone()))?;
        log::debug!("{} forked {} (handle {})", me, child, handle);
        self.start(child);
        Ok(handle)
    }
}
