//! Drive-cycle tests: hiring order, progress reporting, suspension, and
//! the suppression gate.
