//! Generic opcode routines and the runtime helpers compiled code calls.
//!
//! Every routine has the fallback signature: interpreter state, two
//! immediates and the native re-entry address of the instruction that
//! follows the call. The result is ignored for plain opcodes, is a boolean
//! for branches, and for returning opcodes is either `RESUME_RETURN` or the
//! address to continue at.
//!
//! Routines must never unwind: guest errors are recorded on the state block
//! with `InterpreterState::raise` and the routine leaves a well-formed
//! stack behind. Computed jumps get the continuation for their target as
//! the first immediate and return the continuation to take.

use super::interpreter::InterpreterState;
use super::value::tags::*;
use super::value::{self, HeapArray, Object, Svalue};

pub type FallbackFn = unsafe extern "C" fn(*mut InterpreterState, i64, i64, usize) -> usize;

/// Result of a returning opcode that leaves the current function.
pub const RESUME_RETURN: usize = usize::MAX;

macro_rules! fallback {
    ($(#[$m:meta])* fn $name:ident($st:ident, $a:pat, $b:pat, $re:pat) $body:block) => {
        $(#[$m])*
        /// # Safety
        /// `ctx` must point at a live state block whose stack, frame and
        /// context satisfy the opcode's operand requirements.
        #[allow(unused_unsafe, unused_variables)]
        pub unsafe extern "C" fn $name(
            ctx: *mut InterpreterState,
            arg0: i64,
            arg1: i64,
            reentry: usize,
        ) -> usize {
            let $st = unsafe { &mut *ctx };
            let $a = arg0;
            let $b = arg1;
            let $re = reentry;
            unsafe { $body }
        }
    };
}

/// Pushes a copy of `*src`, taking a reference.
unsafe fn push_svaluep(st: &mut InterpreterState, src: *const Svalue) {
    unsafe {
        let v = *src;
        v.add_ref();
        st.push(v);
    }
}

unsafe fn pop_free(st: &mut InterpreterState) {
    unsafe {
        let mut v = st.pop();
        v.free();
    }
}

unsafe fn push_string(st: &mut InterpreterState, index: i64, subtype: u16) {
    unsafe {
        let fp = st.frame();
        let block = *(*fp.context).strings.add(index as usize);
        let v = Svalue::with_type(T_STRING, subtype, block as u64);
        v.add_ref();
        st.push(v);
    }
}

unsafe fn local_slot(st: &InterpreterState, index: i64) -> *mut Svalue {
    unsafe { st.frame().locals.add(index as usize) }
}

unsafe fn global_index(st: &InterpreterState, index: i64) -> i64 {
    unsafe { index + (*st.frame().context).identifier_level as i64 }
}

fallback!(fn f_dup(st, _, _, _) {
    if st.require(1) {
        let top = st.peek(1);
        push_svaluep(st, top);
    }
    0
});

fallback!(fn f_swap(st, _, _, _) {
    if st.require(2) {
        std::ptr::swap(st.peek(1), st.peek(2));
    }
    0
});

fallback!(fn f_pop_value(st, _, _, _) {
    pop_free(st);
    0
});

fallback!(fn f_const0(st, _, _, _) {
    st.push(Svalue::int(0));
    0
});

fallback!(fn f_const1(st, _, _, _) {
    st.push(Svalue::int(1));
    0
});

fallback!(fn f_const_neg1(st, _, _, _) {
    st.push(Svalue::int(-1));
    0
});

fallback!(fn f_undefined(st, _, _, _) {
    st.push(Svalue::undefined());
    0
});

fallback!(fn f_bignum(st, _, _, _) {
    st.push(Svalue::int(0x7fff_ffff));
    0
});

fallback!(fn f_number(st, a, _, _) {
    st.push(Svalue::int(a));
    0
});

fallback!(fn f_neg_number(st, a, _, _) {
    st.push(Svalue::int(a.wrapping_neg()));
    0
});

fallback!(
    /// The 64-bit immediate arrives as a high and a low 32-bit half.
    fn f_number64(st, hi, lo, _) {
        st.push(Svalue::int(number64(hi, lo)));
        0
    }
);

/// Joins the two halves of a 64-bit immediate.
pub fn number64(hi: i64, lo: i64) -> i64 {
    ((hi as u64) << 32 | (lo as u32) as u64) as i64
}

fallback!(fn f_string(st, a, _, _) {
    push_string(st, a, 0);
    0
});

fallback!(fn f_arrow_string(st, a, _, _) {
    push_string(st, a, STRING_ARROW);
    0
});

fallback!(fn f_constant(st, a, _, _) {
    let src = (*st.frame().context).constants.add(a as usize);
    push_svaluep(st, src);
    0
});

fallback!(fn f_local(st, a, _, _) {
    let src = local_slot(st, a);
    push_svaluep(st, src);
    0
});

fallback!(fn f_two_locals(st, a, b, _) {
    let first = local_slot(st, a);
    push_svaluep(st, first);
    let second = local_slot(st, b);
    push_svaluep(st, second);
    0
});

fallback!(
    /// `locals[a] = locals[b]`.
    fn f_local_to_local(st, a, b, _) {
        if a != b {
            let src = *local_slot(st, b);
            src.add_ref();
            let dst = local_slot(st, a);
            (*dst).free();
            *dst = src;
        }
        0
    }
);

fallback!(fn f_assign_local(st, a, _, _) {
    if !st.require(1) {
        return 0;
    }
    let top = *st.peek(1);
    top.add_ref();
    let dst = local_slot(st, a);
    (*dst).free();
    *dst = top;
    0
});

fallback!(fn f_assign_local_and_pop(st, a, _, _) {
    let top = st.pop();
    let dst = local_slot(st, a);
    (*dst).free();
    *dst = top;
    0
});

fallback!(fn f_global(st, a, _, _) {
    let index = global_index(st, a);
    let mut v = Svalue::default();
    low_object_index_no_free(&mut v, st.frame().current_object, index);
    st.push(v);
    0
});

fallback!(fn f_assign_global(st, a, _, _) {
    if st.require(1) {
        let index = global_index(st, a);
        object_low_set_index(st.frame().current_object, index, st.peek(1));
    }
    0
});

fallback!(fn f_assign_global_and_pop(st, a, _, _) {
    if st.require(1) {
        let index = global_index(st, a);
        object_low_set_index(st.frame().current_object, index, st.peek(1));
        pop_free(st);
    }
    0
});

fallback!(fn f_this_object(st, level, _, _) {
    if level == 0 {
        let obj = st.frame().current_object;
        let v = Svalue::with_type(T_OBJECT, 0, obj as u64);
        v.add_ref();
        st.push(v);
    } else {
        st.raise(format!("this_object: no parent at level {}", level));
        st.push(Svalue::undefined());
    }
    0
});

fallback!(
    /// Sets the frame's argument and local counts.
    fn f_init_frame(st, num_args, num_locals, _) {
        let fp = st.frame();
        fp.num_args = num_args as u16;
        fp.num_locals = num_locals as u16;
        0
    }
);

fallback!(
    /// Values below `locals + a` survive an unwind of this frame.
    fn f_protect_stack(st, a, _, _) {
        let fp = st.frame();
        fp.expendible = fp.locals.add(a as usize);
        0
    }
);

fallback!(fn f_sizeof_local(st, a, _, _) {
    let n = svalue_size(st, local_slot(st, a));
    st.push(Svalue::int(n));
    0
});

fallback!(
    /// Pushes a pointer to `locals[a]` and a void filler slot.
    fn f_local_lvalue(st, a, _, _) {
        st.push(Svalue::with_type(T_SVALUE_PTR, 0, local_slot(st, a) as u64));
        st.push(Svalue::with_type(T_VOID, 0, 0));
        0
    }
);

fallback!(
    /// Pushes the current object and the identifier of global `a`.
    fn f_global_lvalue(st, a, _, _) {
        let index = global_index(st, a);
        let obj = Svalue::with_type(T_OBJECT, 0, st.frame().current_object as u64);
        obj.add_ref();
        st.push(obj);
        st.push(Svalue::with_type(T_OBJ_INDEX, 0, index as u64));
        0
    }
);

fallback!(
    /// `lvalue = value` for the two-slot lvalue below the value, leaving
    /// the value on the stack.
    fn f_assign(st, _, _, _) {
        if !st.require(3) {
            return 0;
        }
        let value = st.pop();
        let mut key = st.pop();
        let mut target = st.pop();
        match (target.type_tag(), key.type_tag()) {
            (T_SVALUE_PTR, _) => {
                let slot = target.payload as *mut Svalue;
                value.add_ref();
                (*slot).free();
                *slot = value;
            }
            (T_OBJECT, T_OBJ_INDEX) => {
                object_low_set_index(target.payload as *mut Object, key.payload as i64, &value);
            }
            _ => st.raise(format!("cannot assign to {}", target)),
        }
        key.free();
        target.free();
        st.push(value);
        0
    }
);

fallback!(fn f_mark(st, _, _, _) {
    st.push_mark(st.stack_pointer);
    0
});

fallback!(fn f_mark2(st, _, _, _) {
    st.push_mark(st.stack_pointer);
    st.push_mark(st.stack_pointer);
    0
});

fallback!(fn f_mark_x(st, a, _, _) {
    match usize::try_from(a) {
        Ok(slots) if slots <= st.depth() => st.push_mark(st.stack_pointer.sub(slots)),
        _ => st.raise(format!("mark_x {} is below the operand stack", a)),
    }
    0
});

fallback!(fn f_mark_at(st, a, _, _) {
    let at = local_slot(st, a);
    st.push_mark(at);
    0
});

fallback!(fn f_pop_mark(st, _, _, _) {
    st.pop_mark();
    0
});

fallback!(fn f_mark_and_const0(st, _, _, _) {
    st.push_mark(st.stack_pointer);
    st.push(Svalue::int(0));
    0
});

fallback!(fn f_mark_and_const1(st, _, _, _) {
    st.push_mark(st.stack_pointer);
    st.push(Svalue::int(1));
    0
});

fallback!(fn f_mark_and_string(st, a, _, _) {
    st.push_mark(st.stack_pointer);
    push_string(st, a, 0);
    0
});

fallback!(fn f_mark_and_local(st, a, _, _) {
    st.push_mark(st.stack_pointer);
    let src = local_slot(st, a);
    push_svaluep(st, src);
    0
});

fallback!(fn f_mark_and_global(st, a, _, _) {
    st.push_mark(st.stack_pointer);
    f_global(&mut *st, a, 0, 0);
    0
});

fallback!(
    /// Collects everything above the top mark into an array.
    fn f_aggregate(st, _, _, _) {
        let Some(base) = st.pop_mark() else {
            st.push(Svalue::array(Vec::new()));
            return 0;
        };
        if base < st.evaluator_stack || base > st.stack_pointer {
            st.raise("aggregate mark is outside the operand stack".to_string());
            st.push(Svalue::array(Vec::new()));
            return 0;
        }
        let count = st.stack_pointer.offset_from(base) as usize;
        let items = std::slice::from_raw_parts(base, count).to_vec();
        st.stack_pointer = base;
        st.push(Svalue::array(items));
        0
    }
);

/// Element `key` of `coll` with a new reference, or `None` with the error
/// message. Negative integer keys count from the end.
unsafe fn index_value(coll: &Svalue, key: &Svalue) -> Result<Svalue, String> {
    let position = |i: i64, len: usize| {
        let at = if i < 0 { i + len as i64 } else { i };
        usize::try_from(at).ok().filter(|&at| at < len)
    };
    unsafe {
        match (coll.type_tag(), key.as_int()) {
            (T_ARRAY, Some(i)) => {
                let items = &(*(coll.payload as *const HeapArray)).items;
                let v = position(i, items.len())
                    .map(|at| items[at])
                    .ok_or_else(|| format!("index {} is out of range for an array of {}", i, items.len()))?;
                v.add_ref();
                Ok(v)
            }
            (T_STRING, Some(i)) => {
                let text = coll.as_str().unwrap_or("");
                let len = text.chars().count();
                position(i, len)
                    .and_then(|at| text.chars().nth(at))
                    .map(|c| Svalue::int(c as i64))
                    .ok_or_else(|| format!("index {} is out of range for a string of {}", i, len))
            }
            _ => Err(format!("cannot index {} with {}", coll, key)),
        }
    }
}

fallback!(fn f_index(st, _, _, _) {
    if !st.require(2) {
        return 0;
    }
    let mut key = st.pop();
    let mut coll = st.pop();
    let result = index_value(&coll, &key).unwrap_or_else(|message| {
        st.raise(message);
        Svalue::undefined()
    });
    key.free();
    coll.free();
    st.push(result);
    0
});

fallback!(fn f_pos_int_index(st, a, _, _) {
    st.push(Svalue::int(a));
    f_index(&mut *st, 0, 0, 0);
    0
});

fallback!(fn f_neg_int_index(st, a, _, _) {
    st.push(Svalue::int(a.wrapping_neg()));
    f_index(&mut *st, 0, 0, 0);
    0
});

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
}

fn as_number(v: &Svalue) -> Option<f64> {
    match v.type_tag() {
        T_INT => Some(v.payload as i64 as f64),
        T_FLOAT => Some(f64::from_bits(v.payload)),
        _ => None,
    }
}

unsafe fn arith(st: &mut InterpreterState, op: Arith) {
    unsafe {
        let mut rhs = st.pop();
        let mut lhs = st.pop();
        let result = match (lhs.type_tag(), rhs.type_tag(), op) {
            (T_INT, T_INT, Arith::Add) => Some(Svalue::int((lhs.payload as i64).wrapping_add(rhs.payload as i64))),
            (T_INT, T_INT, Arith::Sub) => Some(Svalue::int((lhs.payload as i64).wrapping_sub(rhs.payload as i64))),
            (T_INT, T_INT, Arith::Mul) => Some(Svalue::int((lhs.payload as i64).wrapping_mul(rhs.payload as i64))),
            (T_STRING, T_STRING, Arith::Add) => {
                let text = format!("{}{}", lhs.as_str().unwrap_or(""), rhs.as_str().unwrap_or(""));
                Some(Svalue::string(&text))
            }
            _ => match (as_number(&lhs), as_number(&rhs)) {
                (Some(x), Some(y)) => Some(Svalue::float(match op {
                    Arith::Add => x + y,
                    Arith::Sub => x - y,
                    Arith::Mul => x * y,
                })),
                _ => None,
            },
        };
        let result = result.unwrap_or_else(|| {
            st.raise(format!("bad operands to arithmetic: {} and {}", lhs, rhs));
            Svalue::undefined()
        });
        lhs.free();
        rhs.free();
        st.push(result);
    }
}

fallback!(fn f_add(st, _, _, _) {
    arith(st, Arith::Add);
    0
});

fallback!(fn f_subtract(st, _, _, _) {
    arith(st, Arith::Sub);
    0
});

fallback!(fn f_multiply(st, _, _, _) {
    arith(st, Arith::Mul);
    0
});

fallback!(fn f_negate(st, _, _, _) {
    let mut v = st.pop();
    let result = match v.type_tag() {
        T_INT => Svalue::int((v.payload as i64).wrapping_neg()),
        T_FLOAT => Svalue::float(-f64::from_bits(v.payload)),
        _ => {
            st.raise(format!("bad operand to negate: {}", v));
            Svalue::undefined()
        }
    };
    v.free();
    st.push(result);
    0
});

/// Value equality: numbers and strings by content, everything else by
/// identity.
pub fn values_equal(a: &Svalue, b: &Svalue) -> bool {
    match (a.type_tag(), b.type_tag()) {
        (T_STRING, T_STRING) => a.as_str() == b.as_str(),
        (T_INT | T_FLOAT, T_INT | T_FLOAT) if a.type_tag() != b.type_tag() => {
            as_number(a) == as_number(b)
        }
        (x, y) => x == y && a.payload == b.payload,
    }
}

unsafe fn compare(st: &mut InterpreterState, want: std::cmp::Ordering, name: &str) {
    unsafe {
        let mut rhs = st.pop();
        let mut lhs = st.pop();
        let ordering = match (lhs.type_tag(), rhs.type_tag()) {
            (T_INT, T_INT) => Some((lhs.payload as i64).cmp(&(rhs.payload as i64))),
            (T_STRING, T_STRING) => Some(lhs.as_str().cmp(&rhs.as_str())),
            _ => match (as_number(&lhs), as_number(&rhs)) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        };
        if ordering.is_none() {
            st.raise(format!("bad operands to {}: {} and {}", name, lhs, rhs));
        }
        lhs.free();
        rhs.free();
        st.push(Svalue::int((ordering == Some(want)) as i64));
    }
}

fallback!(fn f_lt(st, _, _, _) {
    compare(st, std::cmp::Ordering::Less, "<");
    0
});

fallback!(fn f_gt(st, _, _, _) {
    compare(st, std::cmp::Ordering::Greater, ">");
    0
});

fallback!(fn f_eq(st, _, _, _) {
    let mut rhs = st.pop();
    let mut lhs = st.pop();
    let equal = values_equal(&lhs, &rhs);
    lhs.free();
    rhs.free();
    st.push(Svalue::int(equal as i64));
    0
});

fallback!(fn f_not(st, _, _, _) {
    let mut v = st.pop();
    let truthy = v.is_truthy();
    v.free();
    st.push(Svalue::int(!truthy as i64));
    0
});

/// Moves the top of the stack into the frame's return slot.
unsafe fn set_return_value(st: &mut InterpreterState) {
    unsafe {
        let top = st.pop();
        let fp = st.frame();
        fp.return_value.free();
        fp.return_value = top;
    }
}

fallback!(fn f_return(st, _, _, _) {
    set_return_value(st);
    RESUME_RETURN
});

fallback!(fn f_return_0(st, _, _, _) {
    st.push(Svalue::int(0));
    set_return_value(st);
    RESUME_RETURN
});

fallback!(fn f_return_1(st, _, _, _) {
    st.push(Svalue::int(1));
    set_return_value(st);
    RESUME_RETURN
});

fallback!(
    /// Returns the top of the stack when it is true, else pops it and
    /// resumes at `reentry`.
    fn f_return_if_true(st, _, _, reentry) {
        if !st.require(1) {
            return reentry;
        }
        if (*st.peek(1)).is_truthy() {
            set_return_value(st);
            RESUME_RETURN
        } else {
            pop_free(st);
            reentry
        }
    }
);

fallback!(fn f_return_if_false(st, _, _, reentry) {
    if !st.require(1) {
        return reentry;
    }
    if !(*st.peek(1)).is_truthy() {
        set_return_value(st);
        RESUME_RETURN
    } else {
        pop_free(st);
        reentry
    }
});

fallback!(fn f_branch(_st, _, _, _) {
    1
});

fallback!(fn f_branch_when_zero(st, _, _, _) {
    let mut v = st.pop();
    let truthy = v.is_truthy();
    v.free();
    !truthy as usize
});

fallback!(fn f_branch_when_non_zero(st, _, _, _) {
    let mut v = st.pop();
    let truthy = v.is_truthy();
    v.free();
    truthy as usize
});

fallback!(fn f_branch_if_local(st, a, _, _) {
    (*local_slot(st, a)).is_truthy() as usize
});

fallback!(fn f_branch_if_not_local(st, a, _, _) {
    !(*local_slot(st, a)).is_truthy() as usize
});

fallback!(
    /// Loop counter at the top of the stack: a non-zero count is
    /// decremented and the branch taken, zero is popped.
    fn f_loop(st, _, _, _) {
        if !st.require(1) {
            return 0;
        }
        let top = st.peek(1);
        match (*top).type_tag() {
            T_INT if (*top).payload != 0 => {
                *top = Svalue::int((*top).payload as i64 - 1);
                1
            }
            T_FLOAT if f64::from_bits((*top).payload) != 0.0 => {
                *top = Svalue::float(f64::from_bits((*top).payload) - 1.0);
                1
            }
            _ => {
                pop_free(st);
                0
            }
        }
    }
);

fallback!(
    /// Error checkpoint: a pending guest error is taken, its message
    /// pushed, and execution continues at the target. Otherwise it
    /// continues with the next instruction.
    fn f_catch(st, target, _, reentry) {
        match st.error.take() {
            Some(message) => {
                tracing::debug!(%message, "caught");
                st.push(Svalue::string(&message));
                target as usize
            }
            None => reentry,
        }
    }
);

/// Tears down a value whose count already reached zero.
///
/// # Safety
/// `sv` must point at a reference-countable value with a zero count.
pub unsafe extern "C" fn really_free_svalue(sv: *mut Svalue) {
    unsafe { value::really_free(&*sv) }
}

/// `*to = obj.globals[index]`, taking a reference.
///
/// # Safety
/// `to` must be writable and `obj` must point at a live object.
pub unsafe extern "C" fn low_object_index_no_free(to: *mut Svalue, obj: *mut Object, index: i64) {
    unsafe {
        let v = match (&(*obj).globals).get(index as usize) {
            Some(v) => *v,
            None => {
                tracing::warn!(index, "global index out of range");
                Svalue::undefined()
            }
        };
        v.add_ref();
        *to = v;
    }
}

/// `obj.globals[index] = *from`, taking a reference and releasing the old
/// value.
///
/// # Safety
/// `from` must point at a live value and `obj` at a live object.
pub unsafe extern "C" fn object_low_set_index(obj: *mut Object, index: i64, from: *const Svalue) {
    unsafe {
        let Some(slot) = (&mut (*obj).globals).get_mut(index as usize) else {
            tracing::warn!(index, "global index out of range");
            return;
        };
        let v = *from;
        v.add_ref();
        slot.free();
        *slot = v;
    }
}

/// Element count of an array or string; anything else raises and counts
/// as zero.
///
/// # Safety
/// `ctx` must point at a live state block and `sv` at a live value.
pub unsafe extern "C" fn svalue_size(ctx: *mut InterpreterState, sv: *const Svalue) -> i64 {
    let st = unsafe { &mut *ctx };
    let v = unsafe { &*sv };
    match v.type_tag() {
        // SAFETY: `T_ARRAY` payloads point at a `HeapArray`.
        T_ARRAY => unsafe { (*(v.payload as *const HeapArray)).items.len() as i64 },
        T_STRING => v.as_str().map_or(0, |s| s.chars().count() as i64),
        _ => {
            st.raise(format!("sizeof: bad argument {}", v));
            0
        }
    }
}

/// Scheduling hook called when the preemption counter overflows.
///
/// # Safety
/// `ctx` must point at a live state block.
pub unsafe extern "C" fn branch_check_threads_etc(ctx: *mut InterpreterState) {
    let st = unsafe { &mut *ctx };
    st.check_counter = 0;
    st.preempt_calls += 1;
    tracing::trace!(calls = st.preempt_calls, "preemption point");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number64_halves() {
        assert_eq!(number64(0, 5), 5);
        assert_eq!(number64(1, 0), 1 << 32);
        assert_eq!(number64(-1, -1), -1);
        assert_eq!(number64(0x1234_5678, 0x9abc_def0u32 as i32 as i64), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn test_values_equal() {
        assert!(values_equal(&Svalue::int(3), &Svalue::int(3)));
        assert!(values_equal(&Svalue::int(3), &Svalue::float(3.0)));
        assert!(!values_equal(&Svalue::int(3), &Svalue::int(4)));
        let mut a = Svalue::string("x");
        let mut b = Svalue::string("x");
        assert!(values_equal(&a, &b));
        unsafe {
            a.free();
            b.free();
        }
    }

    #[test]
    fn test_object_set_and_index() {
        let mut obj = Svalue::object(vec![Svalue::int(0); 2]);
        let block = obj.payload as *mut Object;
        let mut s = Svalue::string("g");
        let mut out = Svalue::default();
        unsafe {
            object_low_set_index(block, 1, &s);
            assert_eq!(s.refs(), Some(2));
            low_object_index_no_free(&mut out, block, 1);
            assert_eq!(out, s);
            assert_eq!(s.refs(), Some(3));
            out.free();
            low_object_index_no_free(&mut out, block, 9);
            assert_eq!(out, Svalue::undefined());

            let before = value::release_count();
            obj.free();
            assert_eq!(s.refs(), Some(1));
            assert_eq!(value::release_count(), before + 1);
            s.free();
            assert_eq!(value::release_count(), before + 2);
        }
    }
}
