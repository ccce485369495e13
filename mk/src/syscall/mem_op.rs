//! `bf_mem_op_*`: the extension memory surface.

use crate::ext::ExtError;
use crate::syscall::check_handle;
use crate::tls::Tls;
use crate::Resources;
use mkabi::layout::{page_align_up, PAGE_SIZE};
use mkabi::syscall::mem_op;
use mkabi::SysStatus;
use mm::PoolError;

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    if let Err(status) = check_handle(tls, res) {
        return status;
    }
    match index {
        mem_op::ALLOC_PAGE => alloc_page(tls, res),
        mem_op::FREE_PAGE => free_page(tls, res),
        mem_op::ALLOC_HUGE => alloc_huge(tls, res),
        mem_op::FREE_HUGE => free_huge(tls, res),
        mem_op::ALLOC_HEAP => alloc_heap(tls, res),
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

fn ext_status(e: ExtError) -> SysStatus {
    match e {
        ExtError::Pool(PoolError::OutOfMemory) | ExtError::HeapExhausted => {
            SysStatus::FAILURE_OUT_OF_MEMORY
        }
        _ => SysStatus::FAILURE_UNKNOWN,
    }
}

fn alloc_page(tls: &mut Tls, res: &Resources) -> SysStatus {
    match res.ext_pool.with_ext(tls.ext, |e| e.alloc_page(res)) {
        Ok(Ok(page)) => {
            tls.ext_reg0 = page.virt;
            tls.ext_reg1 = page.phys;
            SysStatus::SUCCESS
        }
        Ok(Err(e)) => ext_status(e),
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}

fn free_page(tls: &mut Tls, res: &Resources) -> SysStatus {
    let virt = tls.ext_reg1;
    match res.ext_pool.with_ext(tls.ext, |e| e.free_page(res, virt)) {
        Ok(Ok(())) => SysStatus::SUCCESS,
        Ok(Err(_)) => SysStatus::INVALID_PARAMS1,
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}

fn alloc_huge(tls: &mut Tls, res: &Resources) -> SysStatus {
    let bytes = page_align_up(tls.ext_reg1);
    if bytes == 0 {
        return SysStatus::INVALID_PARAMS1;
    }
    let pages = (bytes / PAGE_SIZE as u64) as usize;
    match res.ext_pool.with_ext(tls.ext, |e| e.alloc_huge(res, pages)) {
        Ok(Ok(run)) => {
            tls.ext_reg0 = run.virt;
            tls.ext_reg1 = run.phys;
            SysStatus::SUCCESS
        }
        Ok(Err(e)) => ext_status(e),
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}

fn free_huge(tls: &mut Tls, res: &Resources) -> SysStatus {
    let virt = tls.ext_reg1;
    match res.ext_pool.with_ext(tls.ext, |e| e.free_huge(res, virt)) {
        Ok(Ok(())) => SysStatus::SUCCESS,
        Ok(Err(_)) => SysStatus::INVALID_PARAMS1,
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}

fn alloc_heap(tls: &mut Tls, res: &Resources) -> SysStatus {
    let size = tls.ext_reg1;
    match res.ext_pool.with_ext(tls.ext, |e| e.alloc_heap(res, size)) {
        Ok(Ok(previous_break)) => {
            tls.ext_reg0 = previous_break;
            SysStatus::SUCCESS
        }
        Ok(Err(e)) => ext_status(e),
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}
