//! Synchronous syscalls issued by a worker mid-delivery.
//!
//! A QUERY frame's body is one CBOR-encoded [`VatSyscall`] in the issuing
//! vat's slot space; the answer frame is a CBOR [`SyscallResult`]. All
//! translation in and out of kernel space happens here, against the same
//! crank transaction as the delivery itself, so a delivery rollback undoes
//! its syscalls too.

use serde::{Deserialize, Serialize};
use vos_store::DurableStore;

use crate::error::KernelError;
use crate::ids::{KernelSlot, VatId, VatSlot};
use crate::keeper::KernelKeeper;
use crate::records::{CapData, Message, PromiseState, VatCapData};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "syscall", rename_all = "snake_case")]
pub enum VatSyscall {
    Send {
        target: VatSlot,
        method: String,
        args: VatCapData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<VatSlot>,
    },
    Resolve {
        resolutions: Vec<(VatSlot, bool, VatCapData)>,
    },
    Subscribe {
        promise: VatSlot,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    VatstoreDelete {
        key: String,
    },
    DropImports {
        slots: Vec<VatSlot>,
    },
    RetireImports {
        slots: Vec<VatSlot>,
    },
    RetireExports {
        slots: Vec<VatSlot>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyscallResult {
    Ok {
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "serde_bytes"
        )]
        value: Option<Vec<u8>>,
    },
    Error {
        detail: String,
    },
}

impl SyscallResult {
    pub fn ok() -> Self {
        SyscallResult::Ok { value: None }
    }

    pub fn ok_value(value: Vec<u8>) -> Self {
        SyscallResult::Ok { value: Some(value) }
    }
}

/// Decodes, executes and encodes one syscall exchange. Errors surface to the
/// worker as a `SyscallResult::Error`; fatal kernel errors propagate.
pub fn perform_syscall<S: DurableStore>(
    keeper: &mut KernelKeeper<S>,
    vat: VatId,
    request: &[u8],
) -> Result<Vec<u8>, KernelError> {
    let syscall: VatSyscall = match serde_cbor::from_slice(request) {
        Ok(syscall) => syscall,
        Err(err) => {
            let result = SyscallResult::Error {
                detail: format!("undecodable syscall: {err}"),
            };
            return Ok(serde_cbor::to_vec(&result)?);
        }
    };
    let result = match execute(keeper, vat, syscall) {
        Ok(result) => result,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => SyscallResult::Error {
            detail: err.to_string(),
        },
    };
    Ok(serde_cbor::to_vec(&result)?)
}

fn translate_cap_data<S: DurableStore>(
    keeper: &mut KernelKeeper<S>,
    vat: VatId,
    data: &VatCapData,
) -> Result<CapData, KernelError> {
    let mut vk = keeper.provide_vat_keeper(vat)?;
    let mut slots = Vec::with_capacity(data.slots.len());
    for vslot in &data.slots {
        slots.push(vk.map_vat_to_kernel(*vslot)?);
    }
    Ok(CapData::new(data.body.clone(), slots))
}

fn execute<S: DurableStore>(
    keeper: &mut KernelKeeper<S>,
    vat: VatId,
    syscall: VatSyscall,
) -> Result<SyscallResult, KernelError> {
    match syscall {
        VatSyscall::Send {
            target,
            method,
            args,
            result,
        } => {
            let ktarget = keeper.provide_vat_keeper(vat)?.map_vat_to_kernel(target)?;
            let args = translate_cap_data(keeper, vat, &args)?;
            let result_kp = match result {
                None => None,
                Some(slot) => {
                    let kslot = keeper.provide_vat_keeper(vat)?.map_vat_to_kernel(slot)?;
                    let Some(kp) = kslot.as_promise() else {
                        return Ok(SyscallResult::Error {
                            detail: format!("result slot {kslot} is not a promise"),
                        });
                    };
                    Some(kp)
                }
            };
            keeper.requeue_message(
                ktarget,
                Message {
                    method,
                    args,
                    result: result_kp,
                },
            )?;
            Ok(SyscallResult::ok())
        }
        VatSyscall::Resolve { resolutions } => {
            for (slot, rejected, data) in resolutions {
                let kslot = keeper.provide_vat_keeper(vat)?.map_vat_to_kernel(slot)?;
                let Some(kp) = kslot.as_promise() else {
                    return Ok(SyscallResult::Error {
                        detail: format!("resolution slot {kslot} is not a promise"),
                    });
                };
                let data = translate_cap_data(keeper, vat, &data)?;
                keeper.resolve_promise(Some(vat), kp, rejected, data)?;
                // The resolver is done with the promise; its c-list entry
                // retires with the resolution.
                keeper.provide_vat_keeper(vat)?.delete_clist_entry(kslot)?;
            }
            Ok(SyscallResult::ok())
        }
        VatSyscall::Subscribe { promise } => {
            let kslot = keeper.provide_vat_keeper(vat)?.map_vat_to_kernel(promise)?;
            let Some(kp) = kslot.as_promise() else {
                return Ok(SyscallResult::Error {
                    detail: format!("subscribe slot {kslot} is not a promise"),
                });
            };
            keeper.subscribe(vat, kp)?;
            Ok(SyscallResult::ok())
        }
        VatSyscall::VatstoreGet { key } => {
            let value = keeper.provide_vat_keeper(vat)?.vatstore_get(&key)?;
            Ok(match value {
                Some(value) => SyscallResult::ok_value(value),
                None => SyscallResult::ok(),
            })
        }
        VatSyscall::VatstoreSet { key, value } => {
            keeper.provide_vat_keeper(vat)?.vatstore_set(&key, &value)?;
            Ok(SyscallResult::ok())
        }
        VatSyscall::VatstoreDelete { key } => {
            keeper.provide_vat_keeper(vat)?.vatstore_delete(&key)?;
            Ok(SyscallResult::ok())
        }
        VatSyscall::DropImports { slots }
        | VatSyscall::RetireImports { slots } => {
            for vslot in slots {
                let mut vk = keeper.provide_vat_keeper(vat)?;
                if vslot.allocated_by_vat {
                    return Ok(SyscallResult::Error {
                        detail: format!("{vat} tried to drop export {vslot} as an import"),
                    });
                }
                let kslot = vk.map_vat_to_kernel(vslot)?;
                vk.delete_clist_entry(kslot)?;
            }
            Ok(SyscallResult::ok())
        }
        VatSyscall::RetireExports { slots } => {
            for vslot in slots {
                let mut vk = keeper.provide_vat_keeper(vat)?;
                if !vslot.allocated_by_vat {
                    return Ok(SyscallResult::Error {
                        detail: format!("{vat} tried to retire import {vslot} as an export"),
                    });
                }
                let kslot = vk.map_vat_to_kernel(vslot)?;
                vk.delete_clist_entry(kslot)?;
                if let KernelSlot::Promise(kp) = kslot {
                    // Retiring an export of an unresolved promise abandons
                    // decision authority.
                    if keeper.promise_exists(kp)? {
                        if let PromiseState::Unresolved { decider, .. } = keeper.promise_state(kp)? {
                            if decider == Some(vat) {
                                keeper.clear_decider(kp)?;
                            }
                        }
                    }
                }
            }
            Ok(SyscallResult::ok())
        }
    }
}
