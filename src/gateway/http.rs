// Public and admin surfaces share one state type and one error shape.
include!("http/core.rs");
include!("http/admin.rs");
