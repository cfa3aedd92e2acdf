use jackadi_common::define_stream_mux;
use jackadi_common::rpc::control::{ControlServiceRequest, ControlServiceResponse};

define_stream_mux!(agent;
    ControlServiceRequest => ControlServiceResponse;
);
